//! wims - what's in my store
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Lists the packages of a Nix package source that are installed in the local
//! store.
//!
//! # Pipeline
//!
//! ```text
//! store dir ─► scan ─► candidate names ─► query (per chunk) ─► nix eval
//!                                                                  │
//!           output ◄─ reconcile (exact output, then name-version) ◄┘
//! ```

pub mod cmd;
pub mod ui;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use wims_core::evaluator::{EvalSettings, SafetyGates, StderrMode};
use wims_core::expression::TRACE_VERBOSITY;
use wims_core::DEFAULT_CHUNK_SIZE;
use wims_schema::{DEFAULT_STORE_DIR, PackageSource, SourceError};

/// Console rendering of the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON array of package records
    #[default]
    Json,
    /// Aligned columns
    Table,
}

#[derive(Debug, Parser)]
#[command(name = "wims")]
#[command(version = env!("WIMS_VERSION"), about = "wims - list the packages of a Nix package source that are installed in the store")]
pub struct Cli {
    /// Flake reference providing the package tree (default: flake:nixpkgs)
    #[arg(short = 'f', long, value_name = "REF", conflicts_with = "nixpkgs_channel")]
    pub nixpkgs_flake: Option<String>,

    /// Channel on the Nix search path providing the package tree
    #[arg(short = 'c', long, value_name = "NAME")]
    pub nixpkgs_channel: Option<String>,

    /// Increase verbosity (up to -vvv, which also traces every entry)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Write the matched package records to this file as a JSON array
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Store directory to inventory
    #[arg(long, env = "WIMS_STORE_DIR", default_value = DEFAULT_STORE_DIR)]
    pub store_dir: String,

    /// Nix binary used for evaluation
    #[arg(long, env = "WIMS_NIX", default_value = "nix", value_name = "PROGRAM")]
    pub evaluator: PathBuf,

    /// Installed names per evaluation (0 evaluates all names at once)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Evaluate the whole package tree instead of only installed names
    #[arg(long)]
    pub all: bool,

    /// Kill an evaluation after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Target system (e.g. x86_64-linux) instead of the current one
    #[arg(long)]
    pub system: Option<String>,

    /// Evaluate in pure mode (requires --system)
    #[arg(long, requires = "system")]
    pub pure: bool,

    /// Extra deny rules (TOML), added to the built-in list
    #[arg(long, value_name = "PATH")]
    pub deny_list: Option<PathBuf>,

    /// Also include packages marked as unsupported on this system
    #[arg(long)]
    pub allow_unsupported_system: bool,

    /// Console output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// List installed store paths that matched no package instead
    #[arg(long)]
    pub unmatched: bool,
}

impl Cli {
    /// Verbosity level, capped at the trace level.
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(TRACE_VERBOSITY)
    }

    /// The package source selected on the command line.
    pub fn source(&self) -> Result<PackageSource, SourceError> {
        match (&self.nixpkgs_flake, &self.nixpkgs_channel) {
            (_, Some(channel)) => PackageSource::channel(channel),
            (Some(flake), None) => PackageSource::flake(flake),
            (None, None) => Ok(PackageSource::default()),
        }
    }

    /// Evaluator process settings.
    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            program: self.evaluator.clone(),
            impure: !self.pure,
            show_trace: true,
            gates: SafetyGates {
                allow_unsupported_system: self.allow_unsupported_system,
                ..SafetyGates::default()
            },
            stderr: if self.verbosity() >= TRACE_VERBOSITY {
                StderrMode::Inherit
            } else {
                StderrMode::Capture
            },
            timeout: self.timeout.map(Duration::from_secs),
        }
    }
}
