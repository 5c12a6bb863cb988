//! Error types for the calculator host.

use std::path::PathBuf;

use thiserror::Error;

use crate::breakpoints::BreakpointHandle;

/// Errors that can occur while driving an emulated calculator.
#[derive(Error, Debug)]
pub enum CalcError {
    #[error("Unable to open \"{}\": {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported calculator model: {0}")]
    UnsupportedModel(String),

    #[error("Invalid ROM image: {0}")]
    InvalidRom(String),

    #[error("Invalid save state: {0}")]
    InvalidState(String),

    #[error("No calculator loaded")]
    NoSession,

    #[error("Unknown breakpoint: {0}")]
    UnknownBreakpoint(BreakpointHandle),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Emulation worker panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result type for calculator host operations.
pub type CalcResult<T> = Result<T, CalcError>;
