//! Terminal reporter
//!
//! Progress goes to standard error so standard output stays pipeable.

use std::io::{self, Write};

use crossterm::style::Stylize;
use wims_core::Reporter;

/// Renders progress and evaluator diagnostics on standard error.
///
/// Sections, chunk progress and info lines are shown from verbosity 1;
/// warnings, errors, diagnostics and success lines are always shown.
#[derive(Debug, Clone)]
pub struct TerminalReporter {
    verbosity: u8,
}

impl TerminalReporter {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    fn chatty(&self) -> bool {
        self.verbosity >= 1
    }
}

fn line(text: &str) {
    let mut err = io::stderr().lock();
    let _ = writeln!(err, "{text}");
}

/// Print the end-of-run summary on standard error.
pub fn print_summary(rows: &[(&str, usize)], elapsed_secs: f64) {
    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    for (label, count) in rows {
        line(&format!("  {}  {count}", format!("{label:<width$}").dark_grey()));
    }
    line(&format!("  {}", format!("done in {elapsed_secs:.1}s").dark_grey()));
}

impl Reporter for TerminalReporter {
    fn section(&self, title: &str) {
        if self.chatty() {
            line(&format!("{} {}", "==>".blue().bold(), title.bold()));
        }
    }

    fn chunk(&self, index: usize, total: usize, names: &[String]) {
        if !self.chatty() {
            return;
        }
        let what = if names.is_empty() {
            "full package tree".to_string()
        } else {
            format!("{} names", names.len())
        };
        line(&format!(
            "  {} evaluating {what}",
            format!("[{}/{total}]", index + 1).dark_grey()
        ));
    }

    fn diagnostics(&self, text: &str) {
        for row in text.trim_end().lines() {
            line(&format!("  {} {}", "│".dark_grey(), row.dark_grey()));
        }
    }

    fn info(&self, msg: &str) {
        if self.chatty() {
            line(&format!("  {} {msg}", "•".blue()));
        }
    }

    fn success(&self, msg: &str) {
        line(&format!("  {} {msg}", "✓".green()));
    }

    fn warning(&self, msg: &str) {
        line(&format!("  {} {msg}", "!".yellow().bold()));
    }

    fn error(&self, msg: &str) {
        line(&format!("  {} {msg}", "✗".red().bold()));
    }
}
