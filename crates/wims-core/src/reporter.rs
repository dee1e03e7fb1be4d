//! Reporter trait for dependency injection
//!
//! Lets the catalog builder report progress and evaluator diagnostics without
//! being coupled to a terminal.

pub trait Reporter: Send + Sync {
    /// Indicates a new phase has started (e.g. "Scanning store").
    fn section(&self, title: &str);

    /// A chunk of candidate names is about to be evaluated.
    ///
    /// `index` is zero-based; `names` is empty for a full-universe query.
    fn chunk(&self, index: usize, total: usize, names: &[String]);

    /// Raw diagnostic output from the evaluator (captured standard error or
    /// an unparseable result), shown verbatim.
    fn diagnostics(&self, text: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a success message.
    fn success(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn chunk(&self, index: usize, total: usize, names: &[String]) {
        (**self).chunk(index, total, names);
    }
    fn diagnostics(&self, text: &str) {
        (**self).diagnostics(text);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn success(&self, msg: &str) {
        (**self).success(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn chunk(&self, _: usize, _: usize, _: &[String]) {}
    fn diagnostics(&self, _: &str) {}
    fn info(&self, _: &str) {}
    fn success(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
}

/// Records every call, for asserting on what the engine reported.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingReporter {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[cfg(test)]
impl Reporter for RecordingReporter {
    fn section(&self, title: &str) {
        self.push(format!("section: {title}"));
    }
    fn chunk(&self, index: usize, total: usize, names: &[String]) {
        self.push(format!("chunk: {}/{total} ({} names)", index + 1, names.len()));
    }
    fn diagnostics(&self, text: &str) {
        self.push(format!("diagnostics: {text}"));
    }
    fn info(&self, msg: &str) {
        self.push(format!("info: {msg}"));
    }
    fn success(&self, msg: &str) {
        self.push(format!("success: {msg}"));
    }
    fn warning(&self, msg: &str) {
        self.push(format!("warning: {msg}"));
    }
    fn error(&self, msg: &str) {
        self.push(format!("error: {msg}"));
    }
}
