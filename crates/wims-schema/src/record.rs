//! Package records produced by the evaluator and the matches built from them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::store_path::StorePath;

/// One evaluated package definition.
///
/// This is also the wire shape of the evaluator's JSON output and of the
/// output file: `{ attr, name, version, description, longDescription, outputs }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    /// Fully-qualified dotted attribute path (e.g. `python311Packages.requests`).
    pub attr: String,

    /// Declared package name; may differ from the last segment of `attr`.
    pub name: String,

    /// Declared version, if the definition has one.
    #[serde(default)]
    pub version: Option<String>,

    /// Short human description from the package metadata.
    #[serde(default)]
    pub description: Option<String>,

    /// Long human description from the package metadata.
    #[serde(default)]
    pub long_description: Option<String>,

    /// Output label to resolved path, in declaration order.
    ///
    /// Accepts either a JSON object or a list of `{ "name", "path" }` pairs on
    /// input; always serialized as an object.
    #[serde(default, deserialize_with = "outputs::deserialize")]
    pub outputs: IndexMap<String, String>,
}

impl PackageRecord {
    /// The string compared against stripped store entry names when no
    /// output matches: `name-version`, or the bare `name` when the version is
    /// missing or empty.
    pub fn candidate_name(&self) -> String {
        match self.version.as_deref() {
            Some(version) if !version.is_empty() => format!("{}-{version}", self.name),
            _ => self.name.clone(),
        }
    }
}

mod outputs {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Map(IndexMap<String, String>),
        List(Vec<Entry>),
    }

    #[derive(Deserialize)]
    struct Entry {
        name: String,
        path: String,
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let outputs = match Option::<Wire>::deserialize(deserializer)? {
            None => IndexMap::new(),
            Some(Wire::Map(map)) => map,
            Some(Wire::List(entries)) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for entry in entries {
                    map.entry(entry.name).or_insert(entry.path);
                }
                map
            }
        };
        Ok(outputs)
    }
}

/// How a record was associated with an installed store path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchTier {
    /// A declared output path is present in the store.
    ExactOutput,
    /// An installed entry is named exactly `name-version`.
    NameVersion,
}

impl MatchTier {
    /// Stable label used in console output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactOutput => "exact-output",
            Self::NameVersion => "name-version",
        }
    }
}

impl std::fmt::Display for MatchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package record paired with the installed path it was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    /// The matched record.
    pub record: PackageRecord,
    /// The installed store path that matched.
    pub store_path: StorePath,
    /// Which tier produced the match.
    pub tier: MatchTier,
    /// The output label, set only for [`MatchTier::ExactOutput`].
    pub output: Option<String>,
}

impl MatchResult {
    /// A match on a declared output.
    pub fn exact(record: PackageRecord, store_path: StorePath, output: impl Into<String>) -> Self {
        Self {
            record,
            store_path,
            tier: MatchTier::ExactOutput,
            output: Some(output.into()),
        }
    }

    /// A match on the `name-version` string.
    pub fn name_version(record: PackageRecord, store_path: StorePath) -> Self {
        Self {
            record,
            store_path,
            tier: MatchTier::NameVersion,
            output: None,
        }
    }
}
