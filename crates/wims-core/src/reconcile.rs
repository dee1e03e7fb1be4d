//! Two-tier matching of catalog records against installed store paths.
//!
//! 1. **Exact output**: one of the record's declared output paths is
//!    installed. Outputs are tried in declaration order.
//! 2. **Name-version**: otherwise, an installed entry whose name (hash
//!    stripped) equals the record's `name-version`, or bare `name` when it
//!    has no version. When several installed paths share that name, the one
//!    with the lexicographically smallest hash wins.
//!
//! Records with no match are left out. That is the common case, not an
//! error.

use std::collections::{BTreeSet, HashMap, HashSet};

use wims_schema::{MatchResult, MatchTier, PackageRecord, StoreDir, StorePath};

use crate::catalog::PackageCatalog;

/// The installed store paths of one store directory.
#[derive(Debug, Clone)]
pub struct InstalledSet {
    store: StoreDir,
    paths: BTreeSet<StorePath>,
    by_name: HashMap<String, StorePath>,
}

impl InstalledSet {
    pub fn new(store: StoreDir) -> Self {
        Self {
            store,
            paths: BTreeSet::new(),
            by_name: HashMap::new(),
        }
    }

    /// Add a path. Returns `false` if it was already present.
    pub fn insert(&mut self, path: StorePath) -> bool {
        if self.paths.contains(&path) {
            return false;
        }
        self.by_name
            .entry(path.name().to_string())
            .and_modify(|current| {
                if path < *current {
                    *current = path.clone();
                }
            })
            .or_insert_with(|| path.clone());
        self.paths.insert(path)
    }

    pub fn contains(&self, path: &StorePath) -> bool {
        self.paths.contains(path)
    }

    /// Whether `path` classifies as a store path of this store and is
    /// installed.
    pub fn lookup(&self, path: &str) -> Option<&StorePath> {
        let path = self.store.classify(path)?;
        self.paths.get(&path)
    }

    /// The installed path with the smallest hash whose stripped name is
    /// exactly `name`.
    pub fn by_name(&self, name: &str) -> Option<&StorePath> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Installed paths in path order.
    pub fn iter(&self) -> impl Iterator<Item = &StorePath> {
        self.paths.iter()
    }

    pub fn store(&self) -> &StoreDir {
        &self.store
    }

    /// Distinct stripped names, used to filter targeted queries.
    pub fn candidate_names(&self) -> BTreeSet<String> {
        self.by_name.keys().cloned().collect()
    }
}

impl Extend<StorePath> for InstalledSet {
    fn extend<I: IntoIterator<Item = StorePath>>(&mut self, iter: I) {
        for path in iter {
            self.insert(path);
        }
    }
}

/// Match every record in `catalog` against `installed`.
///
/// Results follow catalog order, with at most one result per record.
pub fn reconcile(catalog: &PackageCatalog, installed: &InstalledSet) -> Vec<MatchResult> {
    catalog
        .iter()
        .filter_map(|record| match_record(record, installed))
        .collect()
}

/// Match a single record.
pub fn match_record(record: &PackageRecord, installed: &InstalledSet) -> Option<MatchResult> {
    for (label, path) in &record.outputs {
        if let Some(hit) = installed.lookup(path) {
            tracing::trace!("{}: output '{label}' installed at {hit}", record.attr);
            return Some(MatchResult::exact(record.clone(), hit.clone(), label));
        }
    }

    let candidate = record.candidate_name();
    let hit = installed.by_name(&candidate)?;
    tracing::trace!("{}: '{candidate}' installed at {hit}", record.attr);
    Some(MatchResult::name_version(record.clone(), hit.clone()))
}

/// Installed paths that no match accounts for.
///
/// A path is accounted for if it is the path of a match, or is a declared
/// output of a matched record (e.g. the `man` output next to a matched
/// `out`).
pub fn unmatched<'a>(installed: &'a InstalledSet, matches: &[MatchResult]) -> Vec<&'a StorePath> {
    let mut accounted: HashSet<&str> = HashSet::new();
    for m in matches {
        accounted.insert(m.store_path.as_str());
        accounted.extend(m.record.outputs.values().map(String::as_str));
    }
    installed
        .iter()
        .filter(|path| !accounted.contains(path.as_str()))
        .collect()
}

/// Counts for the end-of-run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub exact_output: usize,
    pub name_version: usize,
}

impl MatchSummary {
    pub fn of(matches: &[MatchResult]) -> Self {
        let mut summary = Self::default();
        for m in matches {
            match m.tier {
                MatchTier::ExactOutput => summary.exact_output += 1,
                MatchTier::NameVersion => summary.name_version += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.exact_output + self.name_version
    }
}
