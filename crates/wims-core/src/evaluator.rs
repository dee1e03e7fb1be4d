//! External evaluator invocation.
//!
//! The evaluator is a black box: it takes one program text and returns its
//! JSON result on standard output, or fails. [`NixEvaluator`] runs
//! `nix eval` with a fixed argument shape:
//!
//! ```text
//! nix eval --extra-experimental-features 'nix-command flakes' \
//!     --show-trace --json --impure --expr <program>
//! ```
//!
//! Everything that influences the process (program, flags, environment
//! overrides, standard-error handling, timeout) lives in [`EvalSettings`];
//! nothing is read from or written to the ambient process environment.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::expression::shell_quote;

/// Runs a rendered program and returns its standard output.
pub trait Evaluator {
    /// Evaluate `expression` and return the raw standard output.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError`] if the process cannot be started, exits
    /// unsuccessfully, times out, or prints non-UTF-8 output.
    fn evaluate(&self, expression: &str) -> Result<String, EvaluatorError>;
}

impl<T: Evaluator + ?Sized> Evaluator for &T {
    fn evaluate(&self, expression: &str) -> Result<String, EvaluatorError> {
        (**self).evaluate(expression)
    }
}

/// Failures of a single evaluator invocation.
#[derive(thiserror::Error, Debug)]
pub enum EvaluatorError {
    /// The program could not be started (missing binary, permissions).
    #[error("Failed to start '{}': {source}", .program.display())]
    Spawn {
        /// Program that failed to start.
        program: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("Evaluator exited with {}", describe_exit(.code.as_ref()))]
    Exited {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured standard error (empty when it was passed through).
        stderr: String,
    },

    /// The process ran longer than the configured limit and was killed.
    #[error("Evaluator timed out after {limit:?}")]
    TimedOut {
        /// The configured limit.
        limit: Duration,
        /// Standard error captured before the process was killed.
        stderr: String,
    },

    /// Standard output was not valid UTF-8.
    #[error("Evaluator output is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Waiting on or reading from the process failed.
    #[error("I/O error while running evaluator: {0}")]
    Io(#[from] std::io::Error),
}

impl EvaluatorError {
    /// Diagnostic text captured from the evaluator, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Exited { stderr, .. } | Self::TimedOut { stderr, .. } if !stderr.trim().is_empty() => {
                Some(stderr)
            }
            _ => None,
        }
    }
}

fn describe_exit(code: Option<&i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// How the evaluator's standard error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// Capture silently; surfaced only when the invocation fails.
    #[default]
    Capture,
    /// Pass through to the terminal as it is written.
    Inherit,
}

/// Environment overrides that relax the package source's default policy
/// gates, so that the inventory is not truncated by licensing or support
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyGates {
    /// `NIXPKGS_ALLOW_BROKEN`
    pub allow_broken: bool,
    /// `NIXPKGS_ALLOW_UNFREE`
    pub allow_unfree: bool,
    /// `NIXPKGS_ALLOW_INSECURE`
    pub allow_insecure: bool,
    /// `NIXPKGS_ALLOW_UNSUPPORTED_SYSTEM`
    pub allow_unsupported_system: bool,
}

impl SafetyGates {
    /// Environment variables to set on the evaluator process.
    pub fn env(&self) -> Vec<(&'static str, &'static str)> {
        [
            ("NIXPKGS_ALLOW_BROKEN", self.allow_broken),
            ("NIXPKGS_ALLOW_UNFREE", self.allow_unfree),
            ("NIXPKGS_ALLOW_INSECURE", self.allow_insecure),
            ("NIXPKGS_ALLOW_UNSUPPORTED_SYSTEM", self.allow_unsupported_system),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .map(|(key, _)| (key, "1"))
        .collect()
    }
}

impl Default for SafetyGates {
    fn default() -> Self {
        Self {
            allow_broken: true,
            allow_unfree: true,
            allow_insecure: true,
            allow_unsupported_system: false,
        }
    }
}

/// Everything that shapes one evaluator process.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    /// Evaluator binary, looked up on `PATH` when relative.
    pub program: PathBuf,
    /// Permit evaluation that depends on the system environment
    /// (`builtins.currentSystem`, unlocked flake references, `NIX_PATH`).
    pub impure: bool,
    /// Ask for full traces on evaluation errors.
    pub show_trace: bool,
    /// Policy gate overrides.
    pub gates: SafetyGates,
    /// Standard-error handling.
    pub stderr: StderrMode,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nix"),
            impure: true,
            show_trace: true,
            gates: SafetyGates::default(),
            stderr: StderrMode::default(),
            timeout: None,
        }
    }
}

impl EvalSettings {
    /// Command-line arguments for evaluating `expression`.
    pub fn args<'a>(&self, expression: &'a str) -> Vec<&'a str> {
        let mut args = vec![
            "eval",
            "--extra-experimental-features",
            "nix-command flakes",
        ];
        if self.show_trace {
            args.push("--show-trace");
        }
        args.push("--json");
        if self.impure {
            args.push("--impure");
        }
        args.push("--expr");
        args.push(expression);
        args
    }

    /// A copy-pasteable shell rendering of the invocation, environment
    /// overrides included.
    pub fn command_line(&self, expression: &str) -> String {
        let mut parts: Vec<String> = self
            .gates
            .env()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        parts.push(shell_quote(&self.program.to_string_lossy()));
        parts.extend(self.args(expression).into_iter().map(shell_quote));
        parts.join(" ")
    }
}

/// Runs programs through the `nix` command-line evaluator.
#[derive(Debug, Clone, Default)]
pub struct NixEvaluator {
    settings: EvalSettings,
}

impl NixEvaluator {
    /// Create an evaluator with the given settings.
    pub fn new(settings: EvalSettings) -> Self {
        Self { settings }
    }

    /// The settings in use.
    pub fn settings(&self) -> &EvalSettings {
        &self.settings
    }
}

impl Evaluator for NixEvaluator {
    fn evaluate(&self, expression: &str) -> Result<String, EvaluatorError> {
        let settings = &self.settings;

        let mut cmd = Command::new(&settings.program);
        cmd.args(settings.args(expression))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(match settings.stderr {
                StderrMode::Capture => Stdio::piped(),
                StderrMode::Inherit => Stdio::inherit(),
            });
        for (key, value) in settings.gates.env() {
            cmd.env(key, value);
        }

        tracing::debug!(
            "Running evaluator ({} bytes of expression)",
            expression.len()
        );
        tracing::debug!("{}", settings.command_line(expression));

        let mut child = cmd.spawn().map_err(|source| EvaluatorError::Spawn {
            program: settings.program.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty evaluator cannot block on
        // a full pipe while we wait for it.
        let stdout = child.stdout.take().map(Drain::spawn);
        let stderr = child.stderr.take().map(Drain::spawn);

        let status = match settings.timeout {
            Some(limit) => {
                if let Some(status) = child.wait_timeout(limit)? {
                    status
                } else {
                    tracing::warn!("Evaluator exceeded {limit:?}, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    // Descendants of the killed process may still hold the
                    // pipes open, so the readers are left detached.
                    return Err(EvaluatorError::TimedOut {
                        limit,
                        stderr: stderr.map(Drain::snapshot).unwrap_or_default(),
                    });
                }
            }
            None => child.wait()?,
        };

        let stdout = collect(stdout)?;
        let stderr = collect_lossy(stderr);
        finish(status, stdout, stderr)
    }
}

fn finish(status: ExitStatus, stdout: Vec<u8>, stderr: String) -> Result<String, EvaluatorError> {
    if !status.success() {
        return Err(EvaluatorError::Exited {
            code: status.code(),
            stderr,
        });
    }
    if !stderr.trim().is_empty() {
        tracing::debug!("Evaluator diagnostics:\n{stderr}");
    }
    Ok(String::from_utf8(stdout)?)
}

/// A pipe read to completion on its own thread, into a buffer that can be
/// inspected before the reader finishes.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = pipe.read(&mut chunk)?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .map_err(|_| std::io::Error::other("output buffer poisoned"))?
                    .extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, handle }
    }

    /// Wait for end of stream and return everything read.
    fn finish(self) -> std::io::Result<Vec<u8>> {
        self.handle
            .join()
            .map_err(|_| std::io::Error::other("output reader thread panicked"))??;
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("output buffer poisoned"))?;
        Ok(std::mem::take(&mut *buf))
    }

    /// What has been read so far. The reader thread is not waited for.
    fn snapshot(self) -> String {
        self.buf
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

fn collect(drain: Option<Drain>) -> std::io::Result<Vec<u8>> {
    drain.map_or_else(|| Ok(Vec::new()), Drain::finish)
}

fn collect_lossy(drain: Option<Drain>) -> String {
    collect(drain)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
