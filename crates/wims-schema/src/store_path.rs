//! Store path naming convention.
//!
//! Every installed artifact lives directly under the store directory and is
//! named `<hash>-<name>`, where `<hash>` is exactly 32 ASCII alphanumerics.
//! A [`StorePath`] can only be obtained through [`StoreDir::classify`], so a
//! constructed value is always splittable into `(hash, name)`.

use regex::Regex;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Store directory used when nothing else is configured.
pub const DEFAULT_STORE_DIR: &str = "/nix/store";

/// Length of the content hash at the start of every store entry name.
pub const HASH_LEN: usize = 32;

static ENTRY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{32}-(.+)$").expect("entry name pattern is valid"));

static HASH_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{32}-").expect("hash prefix pattern is valid"));

/// Errors raised when strict store path parsing is requested.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorePathError {
    /// The string is not `<store-dir>/<32-char hash>-<name>`.
    #[error("Invalid store path: {0}")]
    Malformed(String),
}

/// The directory that holds all store entries (e.g. `/nix/store`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreDir(String);

impl StoreDir {
    /// Create a store directory, dropping any trailing slashes.
    pub fn new(dir: impl Into<String>) -> Self {
        let mut dir = dir.into();
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        Self(dir)
    }

    /// The directory as a string slice, without a trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory as a filesystem path.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Join an entry name onto the store directory.
    pub fn join(&self, entry: &str) -> PathBuf {
        self.as_path().join(entry)
    }

    /// Test `path` against the naming convention.
    ///
    /// Total and side-effect free: anything that does not match, including
    /// nested paths below a store entry, yields `None`.
    pub fn classify(&self, path: &str) -> Option<StorePath> {
        let entry = self.entry_name(path)?;
        if !ENTRY_NAME.is_match(entry) {
            return None;
        }
        Some(StorePath {
            full: path.to_string(),
            entry_start: path.len() - entry.len(),
        })
    }

    /// Classify a bare directory entry name as listed by `read_dir`.
    pub fn classify_entry(&self, entry: &str) -> Option<StorePath> {
        if entry.contains('/') {
            return None;
        }
        let full = format!("{}/{entry}", self.0.trim_end_matches('/'));
        self.classify(&full)
    }

    /// Remove the store directory and hash prefix from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorePathError::Malformed`] if `path` does not follow the
    /// naming convention. Callers normally gate on [`classify`](Self::classify)
    /// first, so this only fires on internal misuse.
    pub fn strip_hash<'a>(&self, path: &'a str) -> Result<&'a str, StorePathError> {
        let entry = self
            .entry_name(path)
            .ok_or_else(|| StorePathError::Malformed(path.to_string()))?;
        ENTRY_NAME
            .captures(entry)
            .and_then(|caps| caps.get(1))
            .map(|name| name.as_str())
            .ok_or_else(|| StorePathError::Malformed(path.to_string()))
    }

    fn entry_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.0.trim_end_matches('/'))?;
        let entry = rest.strip_prefix('/')?;
        if entry.contains('/') {
            return None;
        }
        Some(entry)
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_DIR)
    }
}

impl std::fmt::Display for StoreDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated path of one entry in the store.
///
/// Ordering is by the full path string. All paths of one store share the
/// directory prefix, so this is the same as ordering by hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    full: String,
    entry_start: usize,
}

impl StorePath {
    /// The full path, e.g. `/nix/store/<hash>-hello-2.12`.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The 32-character content hash.
    pub fn hash(&self) -> &str {
        &self.full[self.entry_start..self.entry_start + HASH_LEN]
    }

    /// The human part of the entry name, after the hash and separator.
    pub fn name(&self) -> &str {
        &self.full[self.entry_start + HASH_LEN + 1..]
    }

    /// The entry name as listed in the store directory (`<hash>-<name>`).
    pub fn entry(&self) -> &str {
        &self.full[self.entry_start..]
    }

    /// Whether this entry is a derivation file rather than a build output.
    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(".drv")
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl AsRef<str> for StorePath {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl Serialize for StorePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

/// Strip a leading `<32-char hash>-` from a bare name, if present.
///
/// Unlike [`StoreDir::strip_hash`] this never fails: input without a hash
/// prefix is returned unchanged.
pub fn remove_hash_prefix(text: &str) -> &str {
    match HASH_PREFIX.find(text) {
        Some(prefix) => &text[prefix.end()..],
        None => text,
    }
}

/// Split a derivation name into its name and version parts, using the same
/// rule as `builtins.parseDrvName`.
///
/// The version starts after the first `-` that is followed by a character
/// other than an ASCII letter, so `hello-2.12` splits into `("hello",
/// Some("2.12"))` and `python3.11-requests-2.31.0-dist` into
/// `("python3.11-requests", Some("2.31.0-dist"))`. Output suffixes stay in
/// the version: `foo-1.0-dev` is `("foo", Some("1.0-dev"))`.
pub fn split_name_version(name: &str) -> (&str, Option<&str>) {
    let bytes = name.as_bytes();
    for (i, byte) in bytes.iter().enumerate() {
        if *byte == b'-' {
            match bytes.get(i + 1) {
                Some(next) if !next.is_ascii_alphabetic() => {
                    return (&name[..i], Some(&name[i + 1..]));
                }
                _ => {}
            }
        }
    }
    (name, None)
}
