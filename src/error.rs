#![forbid(unsafe_code)]

//! Error taxonomy shared by every pipeline component.
//!
//! Each error names the component that classified it and carries a short
//! preview of the offending extractor output or HTTP body so a single log
//! line is enough to reproduce the failure.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Upper bound for previews embedded in errors and log lines.
pub const PREVIEW_LIMIT: usize = 512;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Recovery class of a failure. The orchestrator decides what to do next
/// purely from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Storage,
    Extractor,
    BotDetected,
    Stuck,
    Transient,
    Auth,
    Upload,
    Publish,
    MissingCover,
    Undownloadable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Storage => "storage",
            ErrorKind::Extractor => "extractor",
            ErrorKind::BotDetected => "bot",
            ErrorKind::Stuck => "stuck",
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Upload => "upload",
            ErrorKind::Publish => "publish",
            ErrorKind::MissingCover => "missing_cover",
            ErrorKind::Undownloadable => "undownloadable",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{component}: {kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub component: &'static str,
    pub message: String,
    /// Destination response code, when the service returned one.
    pub code: Option<i64>,
    pub preview: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            component,
            message: message.into(),
            code: None,
            preview: None,
            source: None,
        }
    }

    /// Wraps an I/O failure on `path` into a `Storage` error.
    pub fn storage(component: &'static str, path: &Path, err: std::io::Error) -> Self {
        Self::new(
            ErrorKind::Storage,
            component,
            format!("{}: {err}", path.display()),
        )
        .with_source(err)
    }

    pub fn cancelled(component: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, component, "cancelled by root scope")
    }

    pub fn with_preview(mut self, text: &str) -> Self {
        self.preview = Some(preview(text, PREVIEW_LIMIT));
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Value recorded as `last_error` in status files.
    pub fn status_label(&self) -> String {
        match self.kind {
            ErrorKind::Stuck => "stuck".to_string(),
            ErrorKind::BotDetected => "bot".to_string(),
            _ => preview(&self.to_string(), PREVIEW_LIMIT),
        }
    }
}

/// Truncates `text` to at most `max` characters, marking the cut.
pub fn preview(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
