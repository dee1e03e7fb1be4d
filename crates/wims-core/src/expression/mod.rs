//! Query generation for the package-source expression language.
//!
//! [`ExpressionBuilder::render`] emits one self-contained Nix program made of a
//! fixed [`PRELUDE`] of helpers and a query body. Evaluated with `--json`, the
//! program yields a flat list of package records. Nothing here spawns a
//! process, so the output can be asserted on as plain text.
//!
//! ## Failure containment
//!
//! The package tree is huge, lazily evaluated and partly broken. Every
//! candidate is checked behind `builtins.tryEval`, so one broken definition
//! only drops that entry. Subtrees that abort (which `tryEval` cannot catch)
//! are excluded by name through the [`DenyList`] before they are touched.
//!
//! ## Shape of the result
//!
//! Top-level derivations are inspected first, then every top-level attribute
//! set that is not itself a derivation is treated as a namespace and inspected
//! one level deep. Nothing below that is visited.

mod deny;

pub use deny::{DENY_LIST_VERSION, DenyList, DenyListError, DenyRule, MatchKind, RuleScope};

use std::collections::BTreeSet;

use wims_schema::PackageSource;

/// Verbosity level at which trace statements are embedded in the query.
pub const TRACE_VERBOSITY: u8 = 3;

/// Reusable helper functions, bound to `prelude` for the query body.
///
/// `{SYSTEM}` is replaced with the system expression.
pub const PRELUDE: &str = r#"let
  prelude = {
    system = {SYSTEM};

    tf = x: if x then "true" else "false";

    flatten = value:
      if builtins.isList value then
        builtins.concatMap prelude.flatten value
      else
        [ value ];

    has-prefix = prefix: text:
      (builtins.substring 0 (builtins.stringLength prefix) text) == prefix;

    map-attrs-to-list = f: attrs:
      builtins.map (name: f name attrs.${name}) (builtins.attrNames attrs);

    name-value-pair = name: value: { inherit name value; };

    filter-attrs = predicate: attrs:
      builtins.listToAttrs
        (builtins.concatMap
          (name:
            if predicate name attrs.${name} then
              [ (prelude.name-value-pair name attrs.${name}) ]
            else
              [ ])
          (builtins.attrNames attrs));

    try-or = default: value:
      let
        result = builtins.tryEval value;
      in
        if result.success then result.value else default;

    get-flake = path:
      let
        is-path = (prelude.has-prefix "/" path) || (prelude.has-prefix "." path);
        flake-uri = if is-path then "path:${builtins.toString path}" else path;
      in
        builtins.getFlake flake-uri;

    get-channel = name:
      import (builtins.findFile builtins.nixPath name) { };

    get-packages = source:
      if source.kind == "flake" then
        let
          flake = prelude.get-flake source.reference;
        in
          flake.legacyPackages.${prelude.system}
            or flake.pkgs.${prelude.system}.nixpkgs
            or flake.packages.${prelude.system}
      else
        prelude.get-channel source.reference;
  };
in
"#;

/// Query body. Placeholders are filled in a single pass by [`fill`].
const QUERY: &str = r#"let
  pkgs = prelude.get-packages { kind = {SOURCE_KIND}; reference = {SOURCE_REFERENCE}; };
  lib = pkgs.lib;

  wanted = {WANTED};

  is-wanted = pkg:
    wanted == null || builtins.hasAttr pkg.name wanted;

  is-denied-entry = name:
    {DENIED_ENTRY};

  is-denied-namespace = name:
    {DENIED_NAMESPACE};

  qualify = namespace-name: name:
    if namespace-name == "" then name else "${namespace-name}.${name}";

  is-valid-package = name: pkg:
    let
      result = builtins.tryEval (
        lib.isDerivation pkg
        && !(lib.attrByPath [ "meta" "broken" ] false pkg)
        && builtins.seq pkg.name true
        && pkg ? outputs
        && is-wanted pkg
      );
    in
      !(is-denied-entry name)
      && {TRACE_ENTRY}(result.success && result.value);

  resolve-outputs = package:
    builtins.concatMap
      (label:
        let
          # toString stays inside tryEval and only result.value is used,
          # otherwise the output is forced a second time outside the guard.
          result = builtins.tryEval (builtins.toString package.${label});
        in
          if result.success then [ { name = label; path = result.value; } ] else [ ])
      (prelude.try-or [ ] package.outputs);

  to-record = namespace-name: attr-name: package: {
    attr = qualify namespace-name attr-name;
    name = prelude.try-or attr-name (package.pname or package.name);
    version = prelude.try-or null (package.version or null);
    description = prelude.try-or null (package.meta.description or null);
    longDescription = prelude.try-or null (package.meta.longDescription or null);
    outputs = resolve-outputs package;
  };

  evaluate-namespace = namespace-name: namespace:
    let
      packages = prelude.filter-attrs
        (name: value: is-valid-package (qualify namespace-name name) value)
        namespace;
    in
      {TRACE_NAMESPACE}(prelude.map-attrs-to-list (to-record namespace-name) packages);

  namespaces = prelude.filter-attrs
    (name: value:
      !(is-denied-namespace name)
      && prelude.try-or false (
        builtins.isAttrs value
        && !(lib.isDerivation value)
        && !(builtins.isFunction value)
      ))
    pkgs;
in
  evaluate-namespace "" pkgs
  ++ prelude.flatten (prelude.map-attrs-to-list evaluate-namespace namespaces)
"#;

const TRACE_ENTRY: &str = r#"builtins.trace "wims: evaluating attribute ${name}" "#;

const TRACE_NAMESPACE: &str = r#"builtins.trace "wims: evaluating namespace ${if namespace-name == "" then "<root>" else namespace-name}" "#;

/// Renders package queries for one configuration of deny rules, tracing and
/// target system.
#[derive(Debug, Clone)]
pub struct ExpressionBuilder {
    deny: DenyList,
    trace: bool,
    system: Option<String>,
}

impl ExpressionBuilder {
    /// Create a builder with the given deny list, no tracing, and the
    /// evaluator's current system.
    pub fn new(deny: DenyList) -> Self {
        Self {
            deny,
            trace: false,
            system: None,
        }
    }

    /// Embed per-entry and per-namespace trace statements when `level`
    /// reaches [`TRACE_VERBOSITY`].
    pub fn with_verbosity(mut self, level: u8) -> Self {
        self.trace = level >= TRACE_VERBOSITY;
        self
    }

    /// Pin the target system (e.g. `x86_64-linux`) instead of reading
    /// `builtins.currentSystem`, which is only available in impure mode.
    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    /// The deny list this builder renders.
    pub fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    /// The prelude with the system expression filled in.
    pub fn prelude(&self) -> String {
        let system = match &self.system {
            Some(system) => nix_string(system),
            None => "builtins.currentSystem".to_string(),
        };
        fill(PRELUDE, &[("SYSTEM", system.as_str())])
    }

    /// Render a complete program for `source`.
    ///
    /// Without `names` the program evaluates the whole flattened tree. With
    /// `names` it only keeps derivations whose `name` is in the set (exact,
    /// case-sensitive).
    pub fn render(&self, source: &PackageSource, names: Option<&BTreeSet<String>>) -> String {
        let mut out = self.prelude();
        out.push_str(&self.query(source, names));
        out
    }

    fn query(&self, source: &PackageSource, names: Option<&BTreeSet<String>>) -> String {
        let kind = match source {
            PackageSource::Flake(_) => "flake",
            PackageSource::Channel(_) => "channel",
        };
        let wanted = match names {
            Some(names) => render_name_set(names),
            None => "null".to_string(),
        };
        let (trace_entry, trace_namespace) = if self.trace {
            (TRACE_ENTRY, TRACE_NAMESPACE)
        } else {
            ("", "")
        };
        let source_kind = nix_string(kind);
        let source_reference = nix_string(source.reference());
        let denied_entry = self.deny.to_nix(RuleScope::Entry, "name", "    ");
        let denied_namespace = self.deny.to_nix(RuleScope::Namespace, "name", "    ");

        fill(
            QUERY,
            &[
                ("SOURCE_KIND", source_kind.as_str()),
                ("SOURCE_REFERENCE", source_reference.as_str()),
                ("WANTED", wanted.as_str()),
                ("DENIED_ENTRY", denied_entry.as_str()),
                ("DENIED_NAMESPACE", denied_namespace.as_str()),
                ("TRACE_ENTRY", trace_entry),
                ("TRACE_NAMESPACE", trace_namespace),
            ],
        )
    }
}

impl Default for ExpressionBuilder {
    fn default() -> Self {
        Self::new(DenyList::default())
    }
}

/// Render a set of names as an attribute set usable with `builtins.hasAttr`.
fn render_name_set(names: &BTreeSet<String>) -> String {
    let mut out = String::from(
        "builtins.listToAttrs (builtins.map (name: { inherit name; value = true; }) [",
    );
    for name in names {
        out.push_str("\n    ");
        out.push_str(&nix_string(name));
    }
    out.push_str("\n  ])");
    out
}

/// Quote `value` as a Nix double-quoted string literal.
///
/// Backslashes, quotes and every `$` are escaped, so the literal can never
/// start an interpolation or terminate early.
pub fn nix_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote `value` as a single-quoted POSIX shell argument.
///
/// Used to print copy-pasteable evaluator command lines.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    out.push_str(&value.replace('\'', r"'\''"));
    out.push('\'');
    out
}

/// Replace `{KEY}` placeholders in one left-to-right pass.
///
/// Substituted values are never rescanned, so a value that happens to
/// contain a placeholder is inserted verbatim.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = values.iter().find(|(key, _)| {
            tail.strip_prefix(key)
                .is_some_and(|after| after.starts_with('}'))
        });
        match hit {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn assert_balanced(text: &str) {
        for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
            let opens = text.chars().filter(|c| *c == open).count();
            let closes = text.chars().filter(|c| *c == close).count();
            assert_eq!(opens, closes, "unbalanced {open}{close}");
        }
    }

    #[test]
    fn prelude_defines_helpers() {
        let prelude = ExpressionBuilder::default().prelude();
        for helper in [
            "flatten =",
            "has-prefix =",
            "map-attrs-to-list =",
            "name-value-pair =",
            "filter-attrs =",
            "get-flake =",
            "get-packages =",
        ] {
            assert!(prelude.contains(helper), "missing {helper}");
        }
        assert!(prelude.contains("system = builtins.currentSystem;"));
        assert!(!prelude.contains("{SYSTEM}"));
    }

    #[test]
    fn explicit_system_is_quoted() {
        let prelude = ExpressionBuilder::default()
            .with_system(Some("aarch64-darwin".to_string()))
            .prelude();
        assert!(prelude.contains("system = \"aarch64-darwin\";"));
    }

    #[test]
    fn full_tree_query_has_no_name_filter() {
        let expr = ExpressionBuilder::default().render(&PackageSource::default(), None);
        assert!(expr.contains("wanted = null;"));
        assert!(expr.contains("kind = \"flake\"; reference = \"flake:nixpkgs\";"));
        assert!(expr.contains("builtins.tryEval"));
        assert!(!expr.contains("builtins.trace"));
        for placeholder in [
            "{SOURCE_KIND}",
            "{SOURCE_REFERENCE}",
            "{WANTED}",
            "{DENIED_ENTRY}",
            "{DENIED_NAMESPACE}",
            "{TRACE_ENTRY}",
            "{TRACE_NAMESPACE}",
        ] {
            assert!(!expr.contains(placeholder), "left {placeholder}");
        }
        assert_balanced(&expr);
    }

    #[test]
    fn targeted_query_lists_candidate_names() {
        let expr = ExpressionBuilder::default().render(
            &PackageSource::default(),
            Some(&names(&["hello-2.12.1", "jq-1.7.1"])),
        );
        assert!(expr.contains(
            "wanted = builtins.listToAttrs (builtins.map (name: { inherit name; value = true; }) [\n    \"hello-2.12.1\"\n    \"jq-1.7.1\"\n  ]);"
        ));
        assert!(expr.contains("builtins.hasAttr pkg.name wanted"));
        assert_balanced(&expr);
    }

    #[test]
    fn channel_resolves_through_search_path() {
        let source = PackageSource::channel("nixos-unstable").unwrap();
        let expr = ExpressionBuilder::default().render(&source, None);
        assert!(expr.contains("kind = \"channel\"; reference = \"nixos-unstable\";"));
        assert!(expr.contains("builtins.findFile builtins.nixPath name"));
    }

    #[test]
    fn deny_rules_are_rendered() {
        let expr = ExpressionBuilder::default().render(&PackageSource::default(), None);
        assert!(expr.contains("|| (lib.hasPrefix \"nixosTests.\" name)"));
        assert!(expr.contains("|| (lib.hasInfix \"Cross.\" name)"));
        assert!(expr.contains("|| (lib.hasSuffix \".tkinter\" name)"));
        assert!(expr.contains("|| (lib.hasPrefix \"cudaPackages\" name)"));
        assert!(expr.contains("|| (name == \"vmTools\")"));

        let bare = ExpressionBuilder::new(DenyList::empty()).render(&PackageSource::default(), None);
        assert!(bare.contains("is-denied-entry = name:\n    false\n    ;"));
        assert_balanced(&bare);
    }

    #[test]
    fn namespace_denial_precedes_descent() {
        let expr = ExpressionBuilder::default().render(&PackageSource::default(), None);
        let deny_at = expr.find("!(is-denied-namespace name)").unwrap();
        let probe_at = expr.find("builtins.isAttrs value").unwrap();
        assert!(deny_at < probe_at);
    }

    #[test]
    fn trace_statements_only_at_highest_verbosity() {
        let source = PackageSource::default();
        let quiet = ExpressionBuilder::default().with_verbosity(2).render(&source, None);
        assert!(!quiet.contains("builtins.trace"));

        let loud = ExpressionBuilder::default().with_verbosity(3).render(&source, None);
        assert!(loud.contains("&& builtins.trace \"wims: evaluating attribute ${name}\" (result.success"));
        assert!(loud.contains("builtins.trace \"wims: evaluating namespace"));
        assert_balanced(&loud);
    }

    #[test]
    fn hostile_names_cannot_escape_the_list() {
        let hostile = names(&["a\" ] ++ (builtins.abort \"x\") ++ [ \"", "${builtins.abort 1}", "back\\slash"]);
        let expr = ExpressionBuilder::default().render(&PackageSource::default(), Some(&hostile));
        assert!(expr.contains(r#""a\" ] ++ (builtins.abort \"x\") ++ [ \"""#));
        assert!(expr.contains(r#""\${builtins.abort 1}""#));
        assert!(expr.contains(r#""back\\slash""#));
    }

    #[test]
    fn nix_string_escapes() {
        assert_eq!(nix_string("plain"), "\"plain\"");
        assert_eq!(nix_string("a\"b"), r#""a\"b""#);
        assert_eq!(nix_string("${x}"), r#""\${x}""#);
        assert_eq!(nix_string("a\\b"), r#""a\\b""#);
        assert_eq!(nix_string("l1\nl2"), r#""l1\nl2""#);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn fill_is_single_pass() {
        assert_eq!(fill("a {X} b", &[("X", "{X}")]), "a {X} b");
        assert_eq!(fill("{ {X} }", &[("X", "1")]), "{ 1 }");
        assert_eq!(fill("{Y}", &[("X", "1")]), "{Y}");
        assert_eq!(fill("tail {", &[]), "tail {");
    }
}
