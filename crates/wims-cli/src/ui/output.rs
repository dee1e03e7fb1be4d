//! Match output formatting
//!
//! Console rendering (JSON or aligned columns) and the output file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use wims_schema::{MatchResult, PackageRecord, StorePath, split_name_version};

use crate::OutputFormat;

const ATTR_WIDTH: usize = 36;
const VERSION_WIDTH: usize = 16;
const TIER_WIDTH: usize = 12;

/// Print matches to standard output.
pub fn print_matches(matches: &[MatchResult], format: OutputFormat) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    render_matches(&mut out, matches, format)?;
    out.flush()?;
    Ok(())
}

/// Render matches into `out`.
///
/// JSON renders the matched package records only, as a pretty-printed array.
pub fn render_matches(out: &mut impl Write, matches: &[MatchResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &records(matches))?;
            writeln!(out)?;
        }
        OutputFormat::Table => {
            writeln!(
                out,
                "{}",
                format!(
                    "{:<aw$} {:<vw$} {:<tw$} {}",
                    "attr",
                    "version",
                    "match",
                    "store path",
                    aw = ATTR_WIDTH,
                    vw = VERSION_WIDTH,
                    tw = TIER_WIDTH,
                )
                .dark_grey()
            )?;
            for m in matches {
                let tier = match &m.output {
                    Some(label) => label.clone(),
                    None => m.tier.to_string(),
                };
                writeln!(
                    out,
                    "{} {} {} {}",
                    format!("{:<ATTR_WIDTH$}", m.record.attr).cyan(),
                    format!("{:<VERSION_WIDTH$}", m.record.version.as_deref().unwrap_or("-")).green(),
                    format!("{tier:<TIER_WIDTH$}").dark_grey(),
                    m.store_path.as_str().dark_grey(),
                )?;
            }
        }
    }
    Ok(())
}

/// Print installed paths that matched nothing.
pub fn print_unmatched(paths: &[&StorePath], format: OutputFormat) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    render_unmatched(&mut out, paths, format)?;
    out.flush()?;
    Ok(())
}

/// Render unmatched installed paths into `out`.
///
/// JSON renders objects of `{ path, name, version }`.
pub fn render_unmatched(out: &mut impl Write, paths: &[&StorePath], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let entries: Vec<serde_json::Value> = paths
                .iter()
                .map(|path| {
                    let (name, version) = split_name_version(path.name());
                    serde_json::json!({
                        "path": path.as_str(),
                        "name": name,
                        "version": version,
                    })
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
        OutputFormat::Table => {
            writeln!(
                out,
                "{}",
                format!("{:<aw$} {:<vw$} {}", "name", "version", "store path", aw = ATTR_WIDTH, vw = VERSION_WIDTH)
                    .dark_grey()
            )?;
            for path in paths {
                let (name, version) = split_name_version(path.name());
                writeln!(
                    out,
                    "{} {} {}",
                    format!("{name:<ATTR_WIDTH$}").cyan(),
                    format!("{:<VERSION_WIDTH$}", version.unwrap_or("-")).green(),
                    path.as_str().dark_grey(),
                )?;
            }
        }
    }
    Ok(())
}

/// Write the matched package records to `path` as one compact JSON array.
pub fn write_matches(path: &Path, matches: &[MatchResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &records(matches))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn records(matches: &[MatchResult]) -> Vec<&PackageRecord> {
    matches.iter().map(|m| &m.record).collect()
}
