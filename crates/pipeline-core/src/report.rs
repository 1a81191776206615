//! Severity-leveled reporting, the way every plugin and the supervisor
//! surface diagnostics without depending on how those diagnostics are
//! ultimately routed (console, control socket, log file).
//!
//! This is the `Report` abstraction from the original command-line
//! framework, realized over `tracing` rather than a hand-rolled logger:
//! the trait exists so plugin code calls `report.error(...)` instead of
//! `tracing::error!` directly, which keeps severity counting (used by
//! `--max-severity`-style exit-code decisions) in one place.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
}

/// A sink for plugin/supervisor diagnostics. The default implementation
/// forwards to `tracing` at the matching level and keeps a running count
/// of warnings and errors for exit-code purposes.
pub trait Report: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    fn debug(&self, message: &str) {
        self.log(Severity::Debug, message);
    }
    fn verbose(&self, message: &str) {
        self.log(Severity::Verbose, message);
    }
    fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }
    fn warning(&self, message: &str) {
        self.log(Severity::Warning, message);
    }
    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

/// Default `Report` backed by `tracing`, with atomic warning/error
/// counters for deciding the supervisor's process exit code.
pub struct TracingReport {
    warnings: AtomicU32,
    errors: AtomicU32,
}

impl TracingReport {
    pub fn new() -> Self {
        TracingReport {
            warnings: AtomicU32::new(0),
            errors: AtomicU32::new(0),
        }
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    /// 0 if nothing above warning was reported, 1 if only warnings, 2 if
    /// at least one error was reported.
    pub fn exit_code(&self) -> i32 {
        if self.error_count() > 0 {
            2
        } else if self.warning_count() > 0 {
            1
        } else {
            0
        }
    }
}

impl Default for TracingReport {
    fn default() -> Self {
        TracingReport::new()
    }
}

impl Report for TracingReport {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Verbose => tracing::trace!("{message}"),
            Severity::Info => tracing::info!("{message}"),
            Severity::Warning => {
                self.warnings.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("{message}");
            }
            Severity::Error => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                tracing::error!("{message}");
            }
        }
    }
}
