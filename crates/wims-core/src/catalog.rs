//! Package catalog construction.
//!
//! [`CatalogBuilder`] renders queries, hands them to an [`Evaluator`] one
//! chunk at a time and parses the JSON arrays that come back into a
//! [`PackageCatalog`]. A failing chunk is reported and contributes nothing;
//! it never aborts the run.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use wims_schema::{PackageRecord, PackageSource};

use crate::evaluator::{Evaluator, EvaluatorError};
use crate::expression::ExpressionBuilder;
use crate::reporter::Reporter;

/// Candidate names per evaluator invocation.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Package records in evaluation order, deduplicated by `attr`.
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    records: Vec<PackageRecord>,
    attrs: HashSet<String>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `record` unless a record with the same `attr` is already
    /// present. Returns whether it was added.
    pub fn insert(&mut self, record: PackageRecord) -> bool {
        if self.attrs.contains(&record.attr) {
            return false;
        }
        self.attrs.insert(record.attr.clone());
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PackageRecord> {
        self.records.iter()
    }

    /// The set of attribute paths in the catalog.
    pub fn attrs(&self) -> &HashSet<String> {
        &self.attrs
    }

    pub fn into_records(self) -> Vec<PackageRecord> {
        self.records
    }
}

impl Extend<PackageRecord> for PackageCatalog {
    fn extend<I: IntoIterator<Item = PackageRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl FromIterator<PackageRecord> for PackageCatalog {
    fn from_iter<I: IntoIterator<Item = PackageRecord>>(iter: I) -> Self {
        let mut catalog = Self::new();
        catalog.extend(iter);
        catalog
    }
}

impl<'a> IntoIterator for &'a PackageCatalog {
    type Item = &'a PackageRecord;
    type IntoIter = std::slice::Iter<'a, PackageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Why one evaluator invocation contributed no records.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    /// Standard output was not JSON at all.
    #[error("Evaluator output is not valid JSON: {source}")]
    MalformedJson {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// Standard output was JSON, but not an array.
    #[error("Expected a JSON array from the evaluator, got {kind}")]
    InvalidOutput { kind: &'static str, raw: String },
}

impl CatalogError {
    /// Text to show the operator verbatim alongside the error.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Evaluator(e) => e.diagnostics(),
            Self::MalformedJson { raw, .. } | Self::InvalidOutput { raw, .. } => {
                (!raw.trim().is_empty()).then_some(raw.as_str())
            }
        }
    }
}

/// A chunk that failed, and the names it was asked about.
#[derive(Debug)]
pub struct ChunkFailure {
    pub index: usize,
    pub names: Vec<String>,
    pub error: CatalogError,
}

/// Records parsed from one evaluator response.
#[derive(Debug, Default)]
pub struct ParsedRecords {
    pub records: Vec<PackageRecord>,
    /// Array elements that did not have the shape of a package record.
    pub skipped: usize,
}

/// Everything a [`CatalogBuilder::build`] run produced.
#[derive(Debug, Default)]
pub struct CatalogOutcome {
    pub catalog: PackageCatalog,
    /// Evaluator invocations attempted.
    pub chunks: usize,
    pub failures: Vec<ChunkFailure>,
    /// Malformed array elements ignored across all chunks.
    pub skipped_entries: usize,
    /// Records dropped because their `attr` is on the deny list.
    pub denied: usize,
}

impl CatalogOutcome {
    /// Whether at least one chunk ran and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        self.chunks > 0 && self.failures.len() == self.chunks
    }
}

/// Builds a [`PackageCatalog`] from a package source.
pub struct CatalogBuilder<'a> {
    evaluator: &'a dyn Evaluator,
    expressions: &'a ExpressionBuilder,
    reporter: &'a dyn Reporter,
    chunk_size: usize,
}

impl<'a> CatalogBuilder<'a> {
    pub fn new(
        evaluator: &'a dyn Evaluator,
        expressions: &'a ExpressionBuilder,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            evaluator,
            expressions,
            reporter,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Names per evaluator invocation; `0` evaluates the whole set at once.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Evaluate `source` into a catalog.
    ///
    /// With `names`, only derivations whose name is in the set are evaluated,
    /// split into chunks of the configured size and run strictly one after
    /// another. Without `names`, the whole tree is evaluated in a single
    /// invocation.
    pub fn build(&self, source: &PackageSource, names: Option<&BTreeSet<String>>) -> CatalogOutcome {
        let chunks: Vec<Option<BTreeSet<String>>> = match names {
            None => vec![None],
            Some(names) if names.is_empty() => {
                tracing::info!("No candidate names, skipping evaluation");
                return CatalogOutcome::default();
            }
            Some(names) if self.chunk_size == 0 || names.len() <= self.chunk_size => {
                vec![Some(names.clone())]
            }
            Some(names) => names
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .chunks(self.chunk_size)
                .map(|chunk| Some(chunk.iter().cloned().collect()))
                .collect(),
        };

        let total = chunks.len();
        let mut outcome = CatalogOutcome {
            chunks: total,
            ..CatalogOutcome::default()
        };

        for (index, chunk) in chunks.into_iter().enumerate() {
            let names: Vec<String> = chunk.iter().flatten().cloned().collect();
            self.reporter.chunk(index, total, &names);

            match self.query(source, chunk.as_ref()) {
                Ok(parsed) => {
                    outcome.skipped_entries += parsed.skipped;
                    let mut added = 0;
                    for record in parsed.records {
                        if self.expressions.deny_list().denies_attr(&record.attr) {
                            tracing::debug!("Dropping denied attribute {}", record.attr);
                            outcome.denied += 1;
                        } else if outcome.catalog.insert(record) {
                            added += 1;
                        }
                    }
                    tracing::debug!("Chunk {}/{total}: {added} new records", index + 1);
                }
                Err(error) => {
                    self.report_failure(index, total, &error);
                    outcome.failures.push(ChunkFailure {
                        index,
                        names,
                        error,
                    });
                }
            }
        }

        if outcome.all_failed() {
            self.reporter
                .error("Every evaluation failed; the catalog is empty");
        }
        outcome
    }

    /// Run one query and parse its response.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the evaluator fails or its output is not a
    /// JSON array.
    pub fn query(
        &self,
        source: &PackageSource,
        names: Option<&BTreeSet<String>>,
    ) -> Result<ParsedRecords, CatalogError> {
        let expression = self.expressions.render(source, names);
        let raw = self.evaluator.evaluate(&expression)?;
        parse_records(&raw)
    }

    fn report_failure(&self, index: usize, total: usize, error: &CatalogError) {
        let msg = format!("Evaluation of chunk {}/{total} failed: {error}", index + 1);
        match error {
            CatalogError::InvalidOutput { .. } => self.reporter.error(&msg),
            _ => self.reporter.warning(&msg),
        }
        if let Some(text) = error.diagnostics() {
            self.reporter.diagnostics(text);
        }
    }
}

/// Parse an evaluator response into package records.
///
/// Array elements that are not package records are skipped and counted.
///
/// # Errors
///
/// Returns [`CatalogError::MalformedJson`] if `raw` is not JSON, and
/// [`CatalogError::InvalidOutput`] if the top-level value is not an array.
pub fn parse_records(raw: &str) -> Result<ParsedRecords, CatalogError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| CatalogError::MalformedJson {
        raw: raw.to_string(),
        source,
    })?;

    let Value::Array(entries) = value else {
        return Err(CatalogError::InvalidOutput {
            kind: json_kind(&value),
            raw: raw.to_string(),
        });
    };

    let mut parsed = ParsedRecords::default();
    for (position, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<PackageRecord>(entry) {
            Ok(record) => parsed.records.push(record),
            Err(e) => {
                tracing::warn!("Skipping malformed entry #{position}: {e}");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{DenyList, nix_string};
    use crate::reporter::{NullReporter, RecordingReporter};
    use serde_json::json;
    use std::sync::Mutex;

    /// Stands in for `nix eval`: answers targeted queries from a fixed
    /// universe by reading the wanted names back out of the expression.
    struct FakeEvaluator {
        universe: Vec<(String, Value)>,
        fail_when_asked_for: Option<String>,
        calls: Mutex<usize>,
    }

    impl FakeEvaluator {
        fn new(universe: Vec<(&str, Value)>) -> Self {
            Self {
                universe: universe
                    .into_iter()
                    .map(|(name, record)| (name.to_string(), record))
                    .collect(),
                fail_when_asked_for: None,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Evaluator for FakeEvaluator {
        fn evaluate(&self, expression: &str) -> Result<String, EvaluatorError> {
            *self.calls.lock().unwrap() += 1;
            let asked = |name: &str| expression.contains(&format!("\n    {}", nix_string(name)));

            if let Some(name) = self.fail_when_asked_for.as_deref().filter(|n| asked(n)) {
                return Err(EvaluatorError::Exited {
                    code: Some(1),
                    stderr: format!("error: evaluation aborted while evaluating {name}"),
                });
            }

            let targeted = !expression.contains("wanted = null;");
            let hits: Vec<&Value> = self
                .universe
                .iter()
                .filter(|(name, _)| !targeted || asked(name))
                .map(|(_, record)| record)
                .collect();
            Ok(serde_json::to_string(&hits).unwrap())
        }
    }

    /// Always answers with the same text.
    struct Canned(&'static str);

    impl Evaluator for Canned {
        fn evaluate(&self, _: &str) -> Result<String, EvaluatorError> {
            Ok(self.0.to_string())
        }
    }

    fn record(attr: &str, name: &str, version: &str) -> Value {
        json!({
            "attr": attr,
            "name": name,
            "version": version,
            "description": null,
            "longDescription": null,
            "outputs": [
                { "name": "out", "path": format!("/nix/store/{}-{name}-{version}", "a".repeat(32)) }
            ]
        })
    }

    fn universe() -> Vec<(&'static str, Value)> {
        vec![
            ("hello-2.12.1", record("hello", "hello", "2.12.1")),
            ("curl-8.5.0", record("curl", "curl", "8.5.0")),
            ("curl-8.5.0", record("curlFull", "curl", "8.5.0")),
            ("jq-1.7.1", record("jq", "jq", "1.7.1")),
            ("python3.11-requests-2.31.0", record("python311Packages.requests", "requests", "2.31.0")),
            ("ripgrep-14.1.0", record("ripgrep", "ripgrep", "14.1.0")),
        ]
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn attrs(outcome: &CatalogOutcome) -> BTreeSet<String> {
        outcome.catalog.attrs().iter().cloned().collect()
    }

    #[test]
    fn chunked_and_unchunked_yield_the_same_attrs() {
        let evaluator = FakeEvaluator::new(universe());
        let expressions = ExpressionBuilder::new(DenyList::empty());
        let wanted = names(&[
            "hello-2.12.1",
            "curl-8.5.0",
            "jq-1.7.1",
            "python3.11-requests-2.31.0",
            "not-in-source-1.0",
        ]);

        let whole = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
            .chunk_size(0)
            .build(&PackageSource::default(), Some(&wanted));
        assert_eq!(whole.chunks, 1);

        let chunked = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
            .chunk_size(2)
            .build(&PackageSource::default(), Some(&wanted));
        assert_eq!(chunked.chunks, 3);

        assert_eq!(attrs(&whole), attrs(&chunked));
        assert_eq!(
            attrs(&whole),
            names(&["hello", "curl", "curlFull", "jq", "python311Packages.requests"])
        );
        assert_eq!(evaluator.calls(), 4);
    }

    #[test]
    fn full_universe_is_one_invocation() {
        let evaluator = FakeEvaluator::new(universe());
        let expressions = ExpressionBuilder::new(DenyList::empty());
        let outcome = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
            .build(&PackageSource::default(), None);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.catalog.len(), 6);
    }

    #[test]
    fn empty_candidate_set_skips_evaluation() {
        let evaluator = FakeEvaluator::new(universe());
        let expressions = ExpressionBuilder::default();
        let outcome = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
            .build(&PackageSource::default(), Some(&BTreeSet::new()));
        assert_eq!(outcome.chunks, 0);
        assert!(outcome.catalog.is_empty());
        assert!(!outcome.all_failed());
        assert_eq!(evaluator.calls(), 0);
    }

    #[test]
    fn failing_chunk_degrades_only_itself() {
        let mut evaluator = FakeEvaluator::new(universe());
        evaluator.fail_when_asked_for = Some("jq-1.7.1".to_string());
        let expressions = ExpressionBuilder::new(DenyList::empty());
        let reporter = RecordingReporter::default();

        let wanted = names(&["curl-8.5.0", "hello-2.12.1", "jq-1.7.1", "ripgrep-14.1.0"]);
        let outcome = CatalogBuilder::new(&evaluator, &expressions, &reporter)
            .chunk_size(2)
            .build(&PackageSource::default(), Some(&wanted));

        // Chunks are taken in name order: [curl, hello] then [jq, ripgrep].
        assert_eq!(outcome.chunks, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);
        assert_eq!(outcome.failures[0].names, ["jq-1.7.1", "ripgrep-14.1.0"]);
        assert!(!outcome.all_failed());
        assert_eq!(attrs(&outcome), names(&["curl", "curlFull", "hello"]));

        let events = reporter.take();
        assert!(events.contains(&"warning: Evaluation of chunk 2/2 failed: Evaluator exited with exit code 1".to_string()));
        assert!(events.contains(&"diagnostics: error: evaluation aborted while evaluating jq-1.7.1".to_string()));
    }

    #[test]
    fn every_chunk_failing_is_an_empty_catalog() {
        struct Broken;
        impl Evaluator for Broken {
            fn evaluate(&self, _: &str) -> Result<String, EvaluatorError> {
                Err(EvaluatorError::Exited {
                    code: Some(1),
                    stderr: String::new(),
                })
            }
        }

        let expressions = ExpressionBuilder::default();
        let reporter = RecordingReporter::default();
        let outcome = CatalogBuilder::new(&Broken, &expressions, &reporter)
            .chunk_size(1)
            .build(&PackageSource::default(), Some(&names(&["a-1", "b-2"])));

        assert!(outcome.all_failed());
        assert!(outcome.catalog.is_empty());
        assert_eq!(
            reporter.take().last().map(String::as_str),
            Some("error: Every evaluation failed; the catalog is empty")
        );
    }

    #[test]
    fn non_array_output_is_an_error_with_raw_text() {
        let expressions = ExpressionBuilder::default();
        let reporter = RecordingReporter::default();
        let evaluator = Canned(r#"{"error":"unexpected"}"#);
        let outcome = CatalogBuilder::new(&evaluator, &expressions, &reporter)
            .build(&PackageSource::default(), None);

        assert!(outcome.all_failed());
        assert!(matches!(
            outcome.failures[0].error,
            CatalogError::InvalidOutput { kind: "an object", .. }
        ));
        let events = reporter.take();
        assert!(events.contains(&"error: Evaluation of chunk 1/1 failed: Expected a JSON array from the evaluator, got an object".to_string()));
        assert!(events.contains(&r#"diagnostics: {"error":"unexpected"}"#.to_string()));
    }

    #[test]
    fn malformed_json_is_a_chunk_failure() {
        let err = parse_records("warning: something\n[").unwrap_err();
        assert!(matches!(err, CatalogError::MalformedJson { .. }));
        assert_eq!(err.diagnostics(), Some("warning: something\n["));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = json!([
            record("hello", "hello", "2.12.1"),
            { "attr": "missing-name" },
            42,
        ])
        .to_string();
        let parsed = parse_records(&raw).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped, 2);
    }

    #[test]
    fn duplicate_attrs_keep_first_record() {
        let evaluator = Canned(
            r#"[{"attr":"hello","name":"hello","version":"1"},
                {"attr":"hello","name":"hello","version":"2"}]"#,
        );
        let expressions = ExpressionBuilder::default();
        let outcome = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
            .build(&PackageSource::default(), None);
        let records = outcome.catalog.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version.as_deref(), Some("1"));
    }

    #[test]
    fn denied_attrs_never_reach_the_catalog() {
        // Evaluator that ignores the rendered deny rules entirely.
        let evaluator = FakeEvaluator::new(vec![
            ("hello-2.12.1", record("hello", "hello", "2.12.1")),
            ("hello-2.12.1", record("pkgsCross.aarch64-multiplatform.hello", "hello", "2.12.1")),
            ("hello-2.12.1", record("pkgsMusl.hello", "hello", "2.12.1")),
            ("hello-2.12.1", record("nodePackages.hello", "hello", "2.12.1")),
        ]);
        let expressions = ExpressionBuilder::default();
        let wanted = names(&["hello-2.12.1"]);

        for size in [0, 1, DEFAULT_CHUNK_SIZE] {
            let outcome = CatalogBuilder::new(&evaluator, &expressions, &NullReporter)
                .chunk_size(size)
                .build(&PackageSource::default(), Some(&wanted));
            assert_eq!(attrs(&outcome), names(&["hello"]));
            assert_eq!(outcome.denied, 3);
        }
    }

    #[test]
    fn chunks_are_reported_in_order() {
        let evaluator = FakeEvaluator::new(universe());
        let expressions = ExpressionBuilder::default();
        let reporter = RecordingReporter::default();
        CatalogBuilder::new(&evaluator, &expressions, &reporter)
            .chunk_size(2)
            .build(&PackageSource::default(), Some(&names(&["a-1", "b-1", "c-1"])));
        assert_eq!(
            reporter.take(),
            ["chunk: 1/2 (2 names)", "chunk: 2/2 (1 names)"]
        );
    }

    #[test]
    fn catalog_dedups_on_collect() {
        let parsed = parse_records(
            &json!([
                record("a", "a", "1"),
                record("b", "b", "1"),
                record("a", "a", "2"),
            ])
            .to_string(),
        )
        .unwrap();
        let catalog: PackageCatalog = parsed.records.into_iter().collect();
        let attrs: Vec<&str> = catalog.iter().map(|r| r.attr.as_str()).collect();
        assert_eq!(attrs, ["a", "b"]);
    }
}
