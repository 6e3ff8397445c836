//! error types for shareguard

use std::time::Duration;

use thiserror::Error;

use crate::helper_client::PairingStatus;
use crate::ids::{KeyDigest, SecretId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === state violations (programming errors, never retried) ===
    #[error("secret is closed")]
    SecretClosed,

    #[error("cannot {operation} a helper with status {status}")]
    InvalidPairingState {
        operation: &'static str,
        status: PairingStatus,
    },

    #[error("share must have been stored with the helper before it can be verified")]
    ShareNotShared,

    #[error("secret {0} already exists")]
    DuplicateSecret(SecretId),

    #[error("helper {0} is already a helper for this secret")]
    DuplicateHelper(KeyDigest),

    #[error("helper {0} is not a helper for this secret")]
    UnknownHelper(KeyDigest),

    #[error("version {0} does not exist")]
    UnknownVersion(u64),

    // === protocol-status failures ===
    #[error("helper replied with failure: {0}")]
    Protocol(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    // === transport failures ===
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    // === splitter errors ===
    #[error("invalid threshold {threshold} for {count} fragments")]
    InvalidThreshold { threshold: usize, count: usize },

    #[error("not enough shares: have {have}, need {need}")]
    NotEnoughShares { have: usize, need: usize },

    #[error("invalid share format")]
    InvalidShareFormat,
}

impl Error {
    /// caller invoked an operation that is illegal in the current state
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            Error::SecretClosed
                | Error::InvalidPairingState { .. }
                | Error::ShareNotShared
                | Error::DuplicateSecret(_)
                | Error::DuplicateHelper(_)
                | Error::UnknownHelper(_)
                | Error::UnknownVersion(_)
        )
    }

    /// failure on the way to or from the helper, eligible for bounded retry
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
