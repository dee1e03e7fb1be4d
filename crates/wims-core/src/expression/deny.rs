//! Exception table of package-tree subtrees that must never be evaluated.
//!
//! Some attributes abort instead of throwing (which `tryEval` cannot catch),
//! recurse without end, or are simply irrelevant for an inventory
//! (cross-compilation sets, OS tests, internal splices). They are listed here
//! as data so the table can grow without touching the query or the matcher.
//!
//! Rules come in two scopes:
//! - [`RuleScope::Entry`] rules match the fully-qualified attribute path of a
//!   candidate package (`netbsd.libedit`, `pkgsStatic`, ...).
//! - [`RuleScope::Namespace`] rules match the name of a top-level attribute set
//!   and skip it entirely before descending into it.
//!
//! Extra rules can be loaded from a versioned TOML file:
//!
//! ```toml
//! version = 1
//!
//! [[rule]]
//! scope = "entry"
//! match = "prefix"
//! pattern = "haskellPackages.broken-thing"
//! reason = "infinite recursion"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::nix_string;

/// Version of the deny-list file format understood by this build.
pub const DENY_LIST_VERSION: u32 = 1;

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// Matched against fully-qualified package attribute paths.
    Entry,
    /// Matched against top-level namespace names before descending.
    Namespace,
}

/// How a rule's pattern is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// The name starts with the pattern.
    Prefix,
    /// The name ends with the pattern.
    Suffix,
    /// The name contains the pattern.
    Infix,
    /// The name equals the pattern.
    Exact,
}

/// One entry of the exception table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    /// Where the rule applies.
    pub scope: RuleScope,
    /// How the pattern is compared.
    #[serde(rename = "match")]
    pub kind: MatchKind,
    /// The pattern itself.
    pub pattern: String,
    /// Why the subtree is excluded; rendered as a comment in the query.
    #[serde(default)]
    pub reason: Option<String>,
}

impl DenyRule {
    /// Create a rule.
    pub fn new(scope: RuleScope, kind: MatchKind, pattern: &str, reason: Option<&str>) -> Self {
        Self {
            scope,
            kind,
            pattern: pattern.to_string(),
            reason: reason.map(str::to_string),
        }
    }

    /// Whether `name` is caught by this rule.
    pub fn matches(&self, name: &str) -> bool {
        let pattern = self.pattern.as_str();
        match self.kind {
            MatchKind::Prefix => name.starts_with(pattern),
            MatchKind::Suffix => name.ends_with(pattern),
            MatchKind::Infix => name.contains(pattern),
            MatchKind::Exact => name == pattern,
        }
    }

    /// Render the rule as a boolean expression over `var`.
    fn to_nix(&self, var: &str) -> String {
        let pattern = nix_string(&self.pattern);
        match self.kind {
            MatchKind::Prefix => format!("(lib.hasPrefix {pattern} {var})"),
            MatchKind::Suffix => format!("(lib.hasSuffix {pattern} {var})"),
            MatchKind::Infix => format!("(lib.hasInfix {pattern} {var})"),
            MatchKind::Exact => format!("({var} == {pattern})"),
        }
    }
}

/// Built-in exception table: (scope, match, pattern, reason).
const DEFAULT_RULES: &[(RuleScope, MatchKind, &str, &str)] = &[
    // Individually broken entries
    (RuleScope::Entry, MatchKind::Suffix, ".tkinter", "unexpected argument 'x11Support'"),
    (RuleScope::Entry, MatchKind::Prefix, "nodePackages", "unexpected argument 'meta'"),
    (RuleScope::Entry, MatchKind::Prefix, "netbsd.libcurses", "type error"),
    (RuleScope::Entry, MatchKind::Prefix, "netbsd.libedit", "type error"),
    (RuleScope::Entry, MatchKind::Prefix, "gnomeExtensions.audio-output-switcher", "no longer exists"),
    (RuleScope::Entry, MatchKind::Prefix, "dockapps.wmsm-app", "undefined variable 'src'"),
    (RuleScope::Entry, MatchKind::Prefix, "dockapps.wmsystemtray", "undefined variable 'platforms'"),
    (RuleScope::Entry, MatchKind::Prefix, "darwin.opencflite", "type error"),
    // Architecture-remapped and cross-compilation package sets
    (RuleScope::Entry, MatchKind::Prefix, "pkgs", "architecture-remapped package set"),
    (RuleScope::Entry, MatchKind::Infix, "Cross.", "cross-compilation target"),
    // Test-only namespaces
    (RuleScope::Entry, MatchKind::Prefix, "nixosTests.", "OS tests"),
    // Namespaces that abort or are internal
    (RuleScope::Namespace, MatchKind::Prefix, "cudaPackages", "aborts instead of throwing"),
    (RuleScope::Namespace, MatchKind::Exact, "vmTools", "vmTools.initrd fails with a type error"),
    (RuleScope::Namespace, MatchKind::Exact, "lib", "library functions"),
    (RuleScope::Namespace, MatchKind::Exact, "__splicedPackages", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "buildPackages", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "targetPackages", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsBuildBuild", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsBuildHost", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsBuildTarget", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsHostHost", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsHostTarget", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsTargetTarget", "internal splice"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsLLVM", "architecture-remapped package set"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsMusl", "architecture-remapped package set"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsStatic", "architecture-remapped package set"),
    (RuleScope::Namespace, MatchKind::Exact, "pkgsCross", "cross-compilation targets"),
];

/// Errors raised while loading a deny-list file.
#[derive(thiserror::Error, Debug)]
pub enum DenyListError {
    /// The file could not be read.
    #[error("Failed to read deny list {}: {source}", .path.display())]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not have the expected shape.
    #[error("Failed to parse deny list: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file declares a format version this build does not know.
    #[error("Unsupported deny list version {0} (expected {expected})", expected = DENY_LIST_VERSION)]
    UnsupportedVersion(u32),

    /// A rule has an empty pattern, which would deny everything.
    #[error("Deny rule #{0} has an empty pattern")]
    EmptyPattern(usize),
}

#[derive(Debug, Deserialize)]
struct DenyListFile {
    version: u32,
    #[serde(default, rename = "rule")]
    rules: Vec<DenyRule>,
}

/// An ordered set of [`DenyRule`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyList {
    rules: Vec<DenyRule>,
}

impl DenyList {
    /// A list with no rules at all.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Parse rules from deny-list TOML.
    ///
    /// # Errors
    ///
    /// Returns [`DenyListError`] if the text is not valid TOML, declares an
    /// unsupported version, or contains a rule with an empty pattern.
    pub fn parse(content: &str) -> Result<Self, DenyListError> {
        let file: DenyListFile = toml::from_str(content)?;
        if file.version != DENY_LIST_VERSION {
            return Err(DenyListError::UnsupportedVersion(file.version));
        }
        if let Some(index) = file.rules.iter().position(|r| r.pattern.is_empty()) {
            return Err(DenyListError::EmptyPattern(index + 1));
        }
        Ok(Self { rules: file.rules })
    }

    /// Read and parse a deny-list file.
    ///
    /// # Errors
    ///
    /// Returns [`DenyListError::Io`] if the file cannot be read, otherwise
    /// the same errors as [`parse`](Self::parse).
    pub fn load(path: &Path) -> Result<Self, DenyListError> {
        let content = std::fs::read_to_string(path).map_err(|source| DenyListError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Append all rules of `other`.
    pub fn extend(&mut self, other: DenyList) {
        self.rules.extend(other.rules);
    }

    /// Add a single rule.
    pub fn push(&mut self, rule: DenyRule) {
        self.rules.push(rule);
    }

    /// All rules in order.
    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// Rules of one scope, in order.
    pub fn scoped(&self, scope: RuleScope) -> impl Iterator<Item = &DenyRule> {
        self.rules.iter().filter(move |r| r.scope == scope)
    }

    /// Whether a package with this fully-qualified attribute path is excluded.
    ///
    /// Entry rules are tested against the whole path; namespace rules against
    /// its first segment when the path is nested.
    pub fn denies_attr(&self, attr: &str) -> bool {
        if self.scoped(RuleScope::Entry).any(|r| r.matches(attr)) {
            return true;
        }
        match attr.split_once('.') {
            Some((namespace, _)) => self.denies_namespace(namespace),
            None => false,
        }
    }

    /// Whether a top-level namespace is skipped entirely.
    pub fn denies_namespace(&self, namespace: &str) -> bool {
        self.scoped(RuleScope::Namespace).any(|r| r.matches(namespace))
    }

    /// Render the rules of `scope` as a Nix boolean expression over `var`,
    /// one rule per line with its reason as a trailing comment.
    pub(crate) fn to_nix(&self, scope: RuleScope, var: &str, indent: &str) -> String {
        let mut out = String::from("false");
        for rule in self.scoped(scope) {
            out.push('\n');
            out.push_str(indent);
            out.push_str("|| ");
            out.push_str(&rule.to_nix(var));
            if let Some(reason) = &rule.reason {
                out.push_str(" # ");
                out.push_str(&reason.replace(['\n', '\r'], " "));
            }
        }
        out.push('\n');
        out.push_str(indent);
        out
    }
}

impl Default for DenyList {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(scope, kind, pattern, reason)| DenyRule::new(*scope, *kind, pattern, Some(reason)))
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_known_subtrees() {
        let deny = DenyList::default();
        assert!(deny.denies_attr("pkgsStatic"));
        assert!(deny.denies_attr("pkgsCross.aarch64-multiplatform.hello"));
        assert!(deny.denies_attr("nixosTests.firefox"));
        assert!(deny.denies_attr("python311Packages.tkinter"));
        assert!(deny.denies_attr("netbsd.libedit"));
        assert!(deny.denies_attr("cudaPackages_12.cudnn"));
        assert!(deny.denies_attr("vmTools.initrd"));
        assert!(deny.denies_attr("nodePackages.prettier"));

        assert!(!deny.denies_attr("hello"));
        assert!(!deny.denies_attr("pkg-config"));
        assert!(!deny.denies_attr("python311Packages.requests"));
        assert!(!deny.denies_attr("vmToolsExtra.thing"));
    }

    #[test]
    fn namespace_rules_only_apply_to_first_segment() {
        let deny = DenyList::default();
        assert!(deny.denies_namespace("lib"));
        assert!(!deny.denies_attr("lib"));
        assert!(deny.denies_attr("lib.something"));
        assert!(!deny.denies_attr("haskellPackages.lib"));
    }

    #[test]
    fn parse_rule_file() {
        let content = r#"
version = 1

[[rule]]
scope = "entry"
match = "exact"
pattern = "haskellPackages.broken"
reason = "infinite recursion"

[[rule]]
scope = "namespace"
match = "prefix"
pattern = "rocmPackages"
"#;
        let deny = DenyList::parse(content).unwrap();
        assert_eq!(deny.rules().len(), 2);
        assert!(deny.denies_attr("haskellPackages.broken"));
        assert!(!deny.denies_attr("haskellPackages.broken-extra"));
        assert!(deny.denies_namespace("rocmPackages_6"));
        assert_eq!(deny.rules()[1].reason, None);
    }

    #[test]
    fn parse_rejects_unknown_version_and_empty_patterns() {
        assert!(matches!(
            DenyList::parse("version = 2"),
            Err(DenyListError::UnsupportedVersion(2))
        ));
        let empty = "version = 1\n[[rule]]\nscope = \"entry\"\nmatch = \"prefix\"\npattern = \"\"\n";
        assert!(matches!(
            DenyList::parse(empty),
            Err(DenyListError::EmptyPattern(1))
        ));
        assert!(matches!(
            DenyList::parse("version = \"one\""),
            Err(DenyListError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = DenyList::load(Path::new("/nonexistent/deny.toml")).unwrap_err();
        assert!(matches!(err, DenyListError::Io { .. }));
    }

    #[test]
    fn extend_keeps_defaults() {
        let mut deny = DenyList::default();
        let before = deny.rules().len();
        deny.extend(DenyList::parse("version = 1").unwrap());
        assert_eq!(deny.rules().len(), before);
        deny.push(DenyRule::new(RuleScope::Entry, MatchKind::Exact, "hello", None));
        assert!(deny.denies_attr("hello"));
    }

    #[test]
    fn renders_rules_as_nix() {
        let mut deny = DenyList::empty();
        deny.push(DenyRule::new(
            RuleScope::Entry,
            MatchKind::Suffix,
            ".tkinter",
            Some("bad\nargument"),
        ));
        deny.push(DenyRule::new(RuleScope::Namespace, MatchKind::Exact, "lib", None));
        assert_eq!(
            deny.to_nix(RuleScope::Entry, "name", "  "),
            "false\n  || (lib.hasSuffix \".tkinter\" name) # bad argument\n  "
        );
        assert_eq!(
            deny.to_nix(RuleScope::Namespace, "name", ""),
            "false\n|| (name == \"lib\")\n"
        );
        assert_eq!(DenyList::empty().to_nix(RuleScope::Entry, "n", ""), "false\n");
    }
}
