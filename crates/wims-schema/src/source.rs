//! Package source descriptors.

/// Flake reference used when no source is given.
pub const DEFAULT_FLAKE: &str = "flake:nixpkgs";

/// Errors raised while validating a [`PackageSource`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The descriptor is empty or only whitespace.
    #[error("Empty {0} reference")]
    Empty(&'static str),

    /// A flake reference contains whitespace or control characters.
    #[error("Invalid flake reference '{0}': must not contain whitespace or control characters")]
    InvalidFlake(String),

    /// A channel name contains characters outside `[A-Za-z0-9._+/-]`.
    #[error("Invalid channel name '{0}': only letters, digits and . _ + - / are allowed")]
    InvalidChannel(String),
}

/// Where the package tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A flake reference such as `flake:nixpkgs`, `github:NixOS/nixpkgs` or
    /// a local path.
    Flake(String),
    /// A channel name resolved through the evaluator's search path
    /// (equivalent to `<name>`).
    Channel(String),
}

impl PackageSource {
    /// Validate and wrap a flake reference.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the reference is empty or contains
    /// whitespace or control characters.
    pub fn flake(reference: &str) -> Result<Self, SourceError> {
        if reference.trim().is_empty() {
            return Err(SourceError::Empty("flake"));
        }
        if reference
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(SourceError::InvalidFlake(reference.to_string()));
        }
        Ok(Self::Flake(reference.to_string()))
    }

    /// Validate and wrap a channel name.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the name is empty or contains characters
    /// that are not valid in a search-path lookup.
    pub fn channel(name: &str) -> Result<Self, SourceError> {
        if name.trim().is_empty() {
            return Err(SourceError::Empty("channel"));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | '/'));
        if !valid {
            return Err(SourceError::InvalidChannel(name.to_string()));
        }
        Ok(Self::Channel(name.to_string()))
    }

    /// The raw reference or channel name.
    pub fn reference(&self) -> &str {
        match self {
            Self::Flake(r) | Self::Channel(r) => r,
        }
    }
}

impl Default for PackageSource {
    fn default() -> Self {
        Self::Flake(DEFAULT_FLAKE.to_string())
    }
}

impl std::fmt::Display for PackageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flake(r) => write!(f, "flake {r}"),
            Self::Channel(c) => write!(f, "channel <{c}>"),
        }
    }
}
