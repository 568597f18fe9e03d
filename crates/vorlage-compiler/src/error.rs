/*
 * error.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Error types for document composition and streaming.
//!
//! Every failure is an [`Error`]: a machine-distinguishable [`ErrorKind`], an
//! optional subject (the offending path, name or position) and an optional
//! chained cause. Errors render as `kind (subject): cause`.

use thiserror::Error;

/// Broad class of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected while composing the document tree. Always fatal, before any output.
    Structural,
    /// Unknown variables or processors. Downgraded to literal text by the reader.
    Resolution,
    /// Fatal mid-stream. Output already produced must be discarded.
    StreamingIntegrity,
    /// Failures of the underlying byte sources.
    Io,
    /// Refusals and lifecycle failures reported by processors.
    Processor,
    /// Invalid compiler or request configuration.
    Configuration,
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    // structural
    #[error("circular inclusion")]
    CircularInclusion,
    #[error("variable has already been defined")]
    AlreadyDefined,
    #[error("missing arguments")]
    MissingArguments,
    #[error("macro prefix detected but no line terminator")]
    UnterminatedMacro,
    #[error("cannot define a processor variable")]
    DefineProcessorVariable,
    #[error("cannot parse definition")]
    InvalidDefinition,
    #[error("failed to include document")]
    Include,
    #[error("failed to interpret macros")]
    Macros,

    // resolution
    #[error("no processor found")]
    NoProcessor,
    #[error("variable not defined in processor")]
    NotDefinedInProcessor,
    #[error("a variable was left undefined")]
    NotDefined,

    // streaming integrity
    #[error("circular definition")]
    CircularDefinition,
    #[error("variable too long")]
    VariableTooLong,
    #[error("variable has an invalid name")]
    InvalidVariableName,
    #[error("stream input consumed twice")]
    DoubleStreamInput,
    #[error("failed to reset variable")]
    ResetVariable,
    #[error("processor failed to define variable")]
    DefineVariable,
    #[error("document stream already failed")]
    StreamFailed,

    // io
    #[error("failed to open file")]
    Open,
    #[error("failed to get identity of file")]
    Identity,
    #[error("failed to read bytes from stream")]
    Read,
    #[error("failed to seek through file")]
    Seek,
    #[error("could not convert file")]
    Convert,
    #[error("cannot rewind")]
    Rewind,
    #[error("failed to close")]
    Close,
    #[error("I/O error")]
    Io,

    // processor
    #[error("invalid processor name")]
    ProcessorName,
    #[error("processor has already been registered")]
    DuplicateProcessor,
    #[error("input requested as both stream and static")]
    InputInStreamAndStatic,
    #[error("processor had critical error")]
    ProcessorCritical,
    #[error("processor denied access")]
    AccessDenied,
    #[error("processor redirect")]
    Redirect,
    #[error("compiles still running")]
    CompilesRunning,
    #[error("processor failed to shut down")]
    Shutdown,

    // configuration
    #[error("invalid configuration")]
    Config,
    #[error("reserved input must start with the reserved prefix")]
    BadReservedInput,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            CircularInclusion | AlreadyDefined | MissingArguments | UnterminatedMacro
            | DefineProcessorVariable | InvalidDefinition | Include | Macros => {
                ErrorCategory::Structural
            }
            NoProcessor | NotDefinedInProcessor | NotDefined => ErrorCategory::Resolution,
            CircularDefinition | VariableTooLong | InvalidVariableName | DoubleStreamInput
            | ResetVariable | DefineVariable | StreamFailed => ErrorCategory::StreamingIntegrity,
            Open | Identity | Read | Seek | Convert | Rewind | Close | Io => ErrorCategory::Io,
            ProcessorName | DuplicateProcessor | InputInStreamAndStatic | ProcessorCritical
            | AccessDenied | Redirect | CompilesRunning | Shutdown => ErrorCategory::Processor,
            Config | BadReservedInput => ErrorCategory::Configuration,
        }
    }
}

/// An error with optional subject and cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}{}", render_subject(.subject), render_cause(.cause))]
pub struct Error {
    kind: ErrorKind,
    subject: Option<String>,
    #[source]
    cause: Option<Box<Error>>,
}

fn render_subject(subject: &Option<String>) -> String {
    match subject {
        Some(subject) => format!(" ({subject})"),
        None => String::new(),
    }
}

fn render_cause(cause: &Option<Box<Error>>) -> String {
    match cause {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            subject: None,
            cause: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn because(mut self, cause: impl Into<Error>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Wrap an I/O failure of `path` under `kind`.
    pub fn io(kind: ErrorKind, path: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::new(kind)
            .with_subject(path.to_string())
            .because(err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// The innermost error of the cause chain.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }

    /// Whether `kind` appears anywhere along the cause chain.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if err.kind == kind {
                return true;
            }
            current = err.cause();
        }
        false
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io).with_subject(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::other(err)
    }
}

/// Result type for composition and streaming.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_kind_only() {
        let err = Error::new(ErrorKind::NotDefined);
        assert_eq!(err.to_string(), "a variable was left undefined");
    }

    #[test]
    fn test_render_subject_and_cause() {
        let err = Error::new(ErrorKind::Include)
            .with_subject("header.html")
            .because(Error::new(ErrorKind::CircularInclusion).with_subject("a -> b -> a"));
        assert_eq!(
            err.to_string(),
            "failed to include document (header.html): circular inclusion (a -> b -> a)"
        );
    }

    #[test]
    fn test_has_kind_walks_chain() {
        let err = Error::new(ErrorKind::Include)
            .because(Error::new(ErrorKind::Include).because(ErrorKind::AlreadyDefined));
        assert!(err.has_kind(ErrorKind::AlreadyDefined));
        assert!(!err.has_kind(ErrorKind::Open));
        assert_eq!(err.root_cause().kind(), ErrorKind::AlreadyDefined);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ErrorKind::CircularInclusion.category(),
            ErrorCategory::Structural
        );
        assert_eq!(ErrorKind::NoProcessor.category(), ErrorCategory::Resolution);
        assert_eq!(
            ErrorKind::VariableTooLong.category(),
            ErrorCategory::StreamingIntegrity
        );
        assert_eq!(ErrorKind::Open.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::io(ErrorKind::Open, "missing.txt", io);
        assert_eq!(
            err.to_string(),
            "failed to open file (missing.txt): I/O error (gone)"
        );
    }
}
