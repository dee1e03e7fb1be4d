pub mod catalog;
pub mod evaluator;
pub mod expression;
pub mod reconcile;
pub mod reporter;
pub mod store;

pub use catalog::{CatalogBuilder, CatalogError, CatalogOutcome, DEFAULT_CHUNK_SIZE, PackageCatalog};
pub use evaluator::{EvalSettings, Evaluator, EvaluatorError, NixEvaluator, SafetyGates, StderrMode};
pub use expression::{DenyList, ExpressionBuilder, PRELUDE};
pub use reconcile::{InstalledSet, MatchSummary, reconcile, unmatched};
pub use reporter::{NullReporter, Reporter};
