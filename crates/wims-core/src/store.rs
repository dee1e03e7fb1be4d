//! Store directory enumeration.

use std::fs;
use std::io;

use wims_schema::StoreDir;

use crate::reconcile::InstalledSet;

/// List the installed artifacts directly under `store`.
///
/// Entries that do not follow the naming convention (`.links`, lock files,
/// non-UTF-8 names) and derivation files are skipped. Not recursive.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn scan(store: &StoreDir) -> io::Result<InstalledSet> {
    let mut installed = InstalledSet::new(store.clone());
    let mut ignored = 0usize;
    let mut derivations = 0usize;

    for entry in fs::read_dir(store.as_path())? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            ignored += 1;
            continue;
        };
        match store.classify_entry(&name) {
            Some(path) if path.is_derivation() => derivations += 1,
            Some(path) => {
                installed.insert(path);
            }
            None => {
                tracing::trace!("Ignoring store entry {name}");
                ignored += 1;
            }
        }
    }

    tracing::debug!(
        "Scanned {store}: {} installed, {derivations} derivations, {ignored} ignored",
        installed.len()
    );
    Ok(installed)
}
