//! Error taxonomy for the claim runner.
//!
//! Only [`StoreError`] is allowed to cross an account boundary: it aborts the
//! whole batch. Everything else is caught at the pipeline edge, reported
//! against the account, and converted into a terminal pipeline status so the
//! scheduler's finalization always runs.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal store conditions. Corruption or a configuration contradiction the
/// operator has to resolve; the run cannot continue.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store document {path} is corrupted: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store io failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(String),

    #[error("database password does not match existing ciphertext")]
    Decryption,
}

/// A transaction the chain rejected or that failed to build. Carries the
/// chain-side error code so the retry wrapper can classify it against the
/// non-retryable policy table, plus the encoded calldata for diagnostics.
#[derive(Debug, Error)]
#[error("{label} failed: {code}")]
pub struct TxError {
    pub label: String,
    pub code: String,
    pub encoded_tx: String,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Aborts the entire batch. Never retried.
    #[error("database: {0}")]
    Store(#[from] StoreError),

    /// Classified by the retry wrapper; known codes become soft negative
    /// results, everything else retries with a gas bump.
    #[error(transparent)]
    Transaction(#[from] TxError),

    /// Network/RPC hiccup. Retried after a short delay.
    #[error("rpc: {0}")]
    Transient(String),

    /// Business-logic failure (e.g. balance below the keep floor). Reported,
    /// pipeline ends failed, retried on a later run of the whole batch.
    #[error("{0}")]
    Soft(String),

    /// Symmetric cipher rejected the ciphertext: wrong password.
    #[error("invalid decryption key")]
    InvalidKey,
}

impl Error {
    /// Whether this error must terminate the whole concurrent batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}
