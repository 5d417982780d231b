//! The failure taxonomy shared by pools, transactions and dispatchers.
//!
//! Every error carries two orthogonal flags consulted by the pool return
//! path and by retrying callers:
//!
//! * `recoverable` — no irreversible side effect occurred, a higher layer
//!   may retry the whole operation;
//! * `terminal` — the resource instance that produced the error must be
//!   disconnected and discarded instead of returned to its pool.

use faststr::FastStr;
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A wait point ran out of request time. The payload is an optional
    /// " waiting for ..." suffix naming the wait point.
    #[error("request deadline{0}")]
    Deadline(FastStr),

    /// Arguments to `execute` failed adapter validation; the instance is
    /// clean and goes back to the pool.
    #[error("{0}")]
    ResourceInput(FastStr),

    /// A protocol-level failure with adapter-supplied classification.
    #[error("{description}")]
    Resource {
        code: Option<FastStr>,
        state: Option<FastStr>,
        description: FastStr,
        recoverable: bool,
        terminal: bool,
    },

    /// A transaction participant terminated without producing a result.
    #[error("{0}")]
    TransactionExecution(FastStr),

    /// The commit phase reported a failure; earlier commits stand.
    #[error("transaction commit failed: {0}")]
    TransactionCommit(FastStr),

    /// `begin_request` after the request factory has been shut down.
    #[error("request cannot begin, request factory has been shut down")]
    FactoryShutdown,

    /// A component refused work because the process is shutting down.
    #[error("{0} is stopped")]
    Stopped(FastStr),

    #[error("configuration error: {0}")]
    Config(FastStr),

    /// Anything else; we don't know what happened, so the instance is
    /// thrown away.
    #[error("{0}")]
    Unclassified(FastStr),
}

impl Error {
    pub fn deadline() -> Self {
        Error::Deadline(FastStr::empty())
    }

    pub fn deadline_waiting(what: &str) -> Self {
        Error::Deadline(format!(" waiting for {what}").into())
    }

    pub fn input(message: impl Into<FastStr>) -> Self {
        Error::ResourceInput(message.into())
    }

    pub fn resource(
        code: Option<FastStr>,
        state: Option<FastStr>,
        description: impl Into<FastStr>,
        recoverable: bool,
        terminal: bool,
    ) -> Self {
        Error::Resource {
            code,
            state,
            description: description.into(),
            recoverable,
            terminal,
        }
    }

    pub fn config(message: impl Into<FastStr>) -> Self {
        Error::Config(message.into())
    }

    pub fn unclassified(message: impl Into<FastStr>) -> Self {
        Error::Unclassified(message.into())
    }

    /// Whether a higher layer may safely retry the failed operation.
    pub fn recoverable(&self) -> bool {
        match self {
            Error::Deadline(_) => true,
            Error::ResourceInput(_) => true,
            Error::Resource { recoverable, .. } => *recoverable,
            Error::TransactionExecution(_) => true,
            Error::TransactionCommit(_) => false,
            Error::FactoryShutdown => false,
            Error::Stopped(_) => false,
            Error::Config(_) => true,
            Error::Unclassified(_) => true,
        }
    }

    /// Whether the resource instance that observed this error must be
    /// disconnected instead of returned to its pool.
    pub fn terminal(&self) -> bool {
        match self {
            Error::Deadline(_) => true,
            Error::ResourceInput(_) => false,
            Error::Resource { terminal, .. } => *terminal,
            Error::TransactionExecution(_) => true,
            Error::TransactionCommit(_) => true,
            Error::FactoryShutdown => false,
            Error::Stopped(_) => false,
            Error::Config(_) => false,
            Error::Unclassified(_) => true,
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::Deadline(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string().into())
    }
}
