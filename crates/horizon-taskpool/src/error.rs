//! Error types for Horizon Taskpool.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A captured task or worker failure.
///
/// Reports are built from panics (in-process workers) or from error values
/// and panics raised inside worker processes. They carry the failure
/// message, the `source()` chain of the original error, and, for failures
/// captured in a worker process, a rendered backtrace from that process.
///
/// Reports are plain data and cross the process boundary unchanged, so the
/// parent observes the same message, chain, and trace that the child
/// captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    message: String,
    chain: Vec<String>,
    trace: Option<String>,
}

impl ErrorReport {
    /// Create a report from a bare message, with no cause chain or trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            chain: Vec::new(),
            trace: None,
        }
    }

    /// Create a report from an error value, walking its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            chain,
            trace: None,
        }
    }

    /// Create a report from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::new(message)
    }

    /// Attach a rendered backtrace to the report.
    pub(crate) fn with_trace(mut self, trace: String) -> Self {
        self.trace = Some(trace);
        self
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The messages of the causes of the failure, outermost first.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// The backtrace rendered in the worker process, if one was captured.
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Render the full report: message, cause chain, and fenced trace.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for cause in &self.chain {
            out.push_str("\ncaused by: ");
            out.push_str(cause);
        }
        if let Some(trace) = &self.trace {
            out.push_str("\n\"\"\"\n");
            out.push_str(trace);
            if !trace.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("\"\"\"");
        }
        out
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorReport {}

/// Conditions that make further work on a pool impossible or invalid.
///
/// Every variant except [`PoolError::Closed`] and [`PoolError::Config`]
/// marks the pool as broken: the failure is stored and re-surfaced by every
/// subsequent public call until the pool is shut down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A public method was called on a closed pool.
    #[error("pool is closed")]
    Closed,

    /// The pool was constructed with invalid parameters.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// A worker initializer panicked or failed; the pool is broken.
    #[error("worker initializer failed")]
    Initializer(#[source] ErrorReport),

    /// A worker finalizer panicked or failed; the pool is broken.
    #[error("worker finalizer failed")]
    Finalizer(#[source] ErrorReport),

    /// A worker crashed outside of task execution; the pool is broken.
    #[error("worker crashed")]
    Worker(#[source] ErrorReport),

    /// The message consumer thread failed; the pool is broken.
    #[error("message consumer failed: {0}")]
    Consumer(String),

    /// A worker process could not be spawned; the pool is broken.
    #[error("failed to spawn worker process: {0}")]
    Spawn(String),
}

impl PoolError {
    /// Whether this error marks the pool as broken (as opposed to merely
    /// closed or misconfigured).
    pub fn is_broken(&self) -> bool {
        !matches!(self, Self::Closed | Self::Config(_))
    }
}

/// Errors surfaced when collecting the outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// A blocking call exceeded its timeout budget. The underlying task
    /// keeps running; only the caller is unblocked.
    #[error("operation timed out")]
    Timeout,

    /// The task was cancelled before a worker picked it up.
    #[error("task was cancelled")]
    Cancelled,

    /// The task body failed. The report carries the captured failure,
    /// including the remote cause chain and trace for process tasks.
    #[error("task failed")]
    Failed(#[source] ErrorReport),

    /// The owning pool rejected the operation.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl TaskError {
    /// The captured failure report, if this is a task failure.
    pub fn report(&self) -> Option<&ErrorReport> {
        match self {
            Self::Failed(report) => Some(report),
            _ => None,
        }
    }
}

/// Returned by internal future setters once a terminal transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("future is already done")]
pub struct InvalidStateError;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn report_from_error_walks_chain() {
        let report = ErrorReport::from_error(&Outer { inner: Inner });
        assert_eq!(report.message(), "outer failure");
        assert_eq!(report.chain(), &["inner failure".to_string()]);
        assert!(report.trace().is_none());
    }

    #[test]
    fn report_from_panic_extracts_str_payloads() {
        let report = ErrorReport::from_panic(Box::new("boom"));
        assert_eq!(report.message(), "boom");
        let report = ErrorReport::from_panic(Box::new(String::from("bang")));
        assert_eq!(report.message(), "bang");
        let report = ErrorReport::from_panic(Box::new(7_u32));
        assert_eq!(report.message(), "task panicked");
    }

    #[test]
    fn report_render_includes_chain_and_trace() {
        let report = ErrorReport::from_error(&Outer { inner: Inner })
            .with_trace("frame 0\nframe 1".to_string());
        let text = report.render();
        assert!(text.starts_with("outer failure"));
        assert!(text.contains("caused by: inner failure"));
        assert!(text.contains("\"\"\"\nframe 0\nframe 1\n\"\"\""));
    }

    #[test]
    fn broken_classification() {
        assert!(!PoolError::Closed.is_broken());
        assert!(!PoolError::Config("bad".into()).is_broken());
        assert!(PoolError::Worker(ErrorReport::new("x")).is_broken());
        assert!(PoolError::Initializer(ErrorReport::new("x")).is_broken());
    }

    #[test]
    fn task_error_report_accessor() {
        let err = TaskError::Failed(ErrorReport::new("oops"));
        assert_eq!(err.report().map(ErrorReport::message), Some("oops"));
        assert!(TaskError::Timeout.report().is_none());
    }
}
