//! Shared types for the Gantry build-graph toolkit.
//!
//! This crate provides the foundational types used across all other Gantry crates:
//! - `GantryError` — unified error taxonomy
//! - `SourceLocation` — file/line position attached to script elements
//! - `DiagnosticSink` — explicit collector for script warnings and errors

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unified error type for all Gantry subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    // === Script Parser Errors ===
    #[error("Script parse error at {file}({line}): {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    // === Expression Errors ===
    #[error("Condition evaluation error at '{token}': {message}")]
    Expression { message: String, token: String },

    // === Graph Construction Errors ===
    #[error("Graph validation failed: {0}")]
    Validation(String),

    #[error("Script loading failed with {errors} error(s)")]
    ScriptFailed { errors: usize },

    #[error("Unknown reference '{name}'")]
    UnknownReference { name: String },

    // === Lock Errors ===
    #[error("Timed out after {waited_ms}ms waiting for lock {path} (held by {holder})")]
    LockTimeout {
        path: PathBuf,
        holder: String,
        waited_ms: u64,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A convenience alias for `Result<T, GantryError>`.
pub type Result<T> = std::result::Result<T, GantryError>;

// ---------------------------------------------------------------------------
// SourceLocation — file/line position for script elements and diagnostics
// ---------------------------------------------------------------------------

/// Position of an element in a script file, carried through parsing and
/// interpretation so every diagnostic can name its origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.file, self.line)
    }
}

// ---------------------------------------------------------------------------
// DiagnosticSink — explicit collector for script warnings and errors
// ---------------------------------------------------------------------------

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// A single recorded warning or error with its source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub location: SourceLocation,
    pub message: String,
}

/// Collects diagnostics during script interpretation.
///
/// Interpretation continues past individual errors so a single pass surfaces
/// the maximal set of problems; callers check [`error_count`](Self::error_count)
/// at the end to decide whether the load succeeded. Every entry is mirrored
/// through `tracing` as it is recorded.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    entries: Vec<Diagnostic>,
    errors: usize,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warning(&mut self, location: &SourceLocation, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{location}: {message}");
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            location: location.clone(),
            message,
        });
    }

    pub fn error(&mut self, location: &SourceLocation, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{location}: {message}");
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            location: location.clone(),
            message,
        });
        self.errors += 1;
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse() {
        let err = GantryError::Parse {
            file: "graph.xml".into(),
            line: 12,
            message: "unexpected character".into(),
        };
        assert_eq!(
            err.to_string(),
            "Script parse error at graph.xml(12): unexpected character"
        );
    }

    #[test]
    fn error_display_expression() {
        let err = GantryError::Expression {
            message: "expected integer".into(),
            token: "abc".into(),
        };
        assert_eq!(
            err.to_string(),
            "Condition evaluation error at 'abc': expected integer"
        );
    }

    #[test]
    fn error_display_script_failed() {
        let err = GantryError::ScriptFailed { errors: 3 };
        assert_eq!(err.to_string(), "Script loading failed with 3 error(s)");
    }

    #[test]
    fn error_display_lock_timeout() {
        let err = GantryError::LockTimeout {
            path: PathBuf::from("/tmp/x.lock"),
            holder: "agent-7".into(),
            waited_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5000ms waiting for lock /tmp/x.lock (held by agent-7)"
        );
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GantryError = io_err.into();
        assert!(matches!(err, GantryError::Io(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: GantryError = json_err.into();
        assert!(matches!(err, GantryError::Json(_)));
    }

    #[test]
    fn source_location_display() {
        let loc = SourceLocation::new("build.xml", 42);
        assert_eq!(loc.to_string(), "build.xml(42)");
    }

    #[test]
    fn sink_counts_errors_not_warnings() {
        let loc = SourceLocation::new("a.xml", 1);
        let mut sink = DiagnosticSink::new();
        sink.warning(&loc, "w1");
        sink.warning(&loc, "w2");
        sink.error(&loc, "e1");
        assert_eq!(sink.error_count(), 1);
        assert_eq!(sink.entries().len(), 3);
        assert_eq!(sink.entries()[2].severity, Severity::Error);
    }

    #[test]
    fn sink_records_location() {
        let loc = SourceLocation::new("b.xml", 7);
        let mut sink = DiagnosticSink::new();
        sink.error(&loc, "bad name");
        assert_eq!(sink.entries()[0].location, loc);
        assert_eq!(sink.entries()[0].message, "bad name");
    }
}
