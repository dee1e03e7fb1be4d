//! Terminal output: result rendering and progress reporting.

pub mod output;
pub mod reporter;

pub use reporter::TerminalReporter;
