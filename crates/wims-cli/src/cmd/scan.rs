use std::time::Instant;

use anyhow::{Context, Result, bail};
use wims_core::catalog::CatalogError;
use wims_core::{
    CatalogBuilder, DenyList, ExpressionBuilder, MatchSummary, NixEvaluator, Reporter, reconcile,
    store, unmatched,
};
use wims_schema::StoreDir;

use crate::Cli;
use crate::ui::output::{print_matches, print_unmatched, write_matches};
use crate::ui::reporter::print_summary;
use crate::ui::TerminalReporter;

/// Inventory the store and match it against the selected package source.
///
/// Usage problems (bad source descriptor, unreadable deny list) are raised
/// before the store or the evaluator is touched.
pub fn scan(cli: &Cli) -> Result<()> {
    let started = Instant::now();
    let verbosity = cli.verbosity();

    let source = cli.source().context("Invalid package source")?;
    let mut deny = DenyList::default();
    if let Some(path) = &cli.deny_list {
        deny.extend(DenyList::load(path).context("Failed to load deny list")?);
    }

    let reporter = TerminalReporter::new(verbosity);
    let store_dir = StoreDir::new(cli.store_dir.as_str());

    reporter.section(&format!("Scanning {store_dir}"));
    let installed = store::scan(&store_dir)
        .with_context(|| format!("Failed to read store directory {store_dir}"))?;
    reporter.info(&format!("{} installed paths", installed.len()));

    let evaluator = NixEvaluator::new(cli.eval_settings());
    let expressions = ExpressionBuilder::new(deny)
        .with_verbosity(verbosity)
        .with_system(cli.system.clone());

    reporter.section(&format!("Evaluating {source}"));
    let names = installed.candidate_names();
    let wanted = if cli.all { None } else { Some(&names) };
    let outcome = CatalogBuilder::new(&evaluator, &expressions, &reporter)
        .chunk_size(cli.chunk_size)
        .build(&source, wanted);
    reporter.info(&format!("{} package records", outcome.catalog.len()));

    reporter.section("Matching");
    let matches = reconcile(&outcome.catalog, &installed);
    let leftover = unmatched(&installed, &matches);

    if cli.unmatched {
        print_unmatched(&leftover, cli.format)?;
    } else {
        print_matches(&matches, cli.format)?;
    }

    if let Some(path) = &cli.output {
        write_matches(path, &matches)?;
        reporter.success(&format!("Wrote {} records to {}", matches.len(), path.display()));
    }

    let summary = MatchSummary::of(&matches);
    print_summary(
        &[
            ("installed paths", installed.len()),
            ("package records", outcome.catalog.len()),
            ("exact-output matches", summary.exact_output),
            ("name-version matches", summary.name_version),
            ("unmatched paths", leftover.len()),
            ("failed evaluations", outcome.failures.len()),
        ],
        started.elapsed().as_secs_f64(),
    );

    let invalid = outcome
        .failures
        .iter()
        .filter(|f| matches!(f.error, CatalogError::InvalidOutput { .. }))
        .count();
    if invalid > 0 {
        bail!("{invalid} evaluation(s) returned output that is not a JSON array");
    }
    Ok(())
}
