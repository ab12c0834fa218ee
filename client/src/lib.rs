pub mod client;
pub mod config;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod ledger;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod session;
pub mod sync;
pub mod tracker;

pub use client::Client;
pub use client::RetryPolicy;
pub use events::Stream;
pub use gateway::Gateway;
pub use ledger::{Ledger, TransferMode, TransferStep};
pub use session::{RoomSession, SessionState};
pub use sync::{LiveView, RoomView, Subscription};
pub use tracker::Tracker;

use chipledger_types::ledger::{ParticipantId, ValidationError};
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed ({status}): {message}")]
    Failed {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("dial timeout")]
    DialTimeout,
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("{0}")]
    Precondition(#[from] Precondition),
    #[error("transfer partially applied (completed: {applied:?}): {source}")]
    PartialTransfer {
        applied: Vec<TransferStep>,
        #[source]
        source: Box<Error>,
    },
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Precondition(Precondition::Invalid(err))
    }
}

/// Coarse classification of an [Error], used to pick what a user is told.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Join with an unknown room code.
    RoomNotFound,
    /// Any gateway call failure: transport, decoding or a rejection by the
    /// store.
    RemoteOperationFailed,
    /// A client-side guard refused the action before anything was written.
    PreconditionNotMet,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RoomNotFound(_) => ErrorKind::RoomNotFound,
            Error::Precondition(_) => ErrorKind::PreconditionNotMet,
            // The atomic procedure's conditional debit
            Error::Failed { status, .. } if *status == reqwest::StatusCode::CONFLICT => {
                ErrorKind::PreconditionNotMet
            }
            _ => ErrorKind::RemoteOperationFailed,
        }
    }
}

/// Client-side guard failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    #[error("set a display name first")]
    MissingName,
    #[error("not in a room")]
    NotInRoom,
    #[error("already in room {0}, leave it first")]
    AlreadyInRoom(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("{0} is not a member of this room")]
    NotMember(ParticipantId),
    #[error("insufficient chips: balance {balance}, requested {amount}")]
    InsufficientChips { balance: i64, amount: i64 },
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
