use crate::store::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("failed to open protocol connection: {0}")]
    Connect(anyhow::Error),

    #[error("connection closed before a pairing credential was issued")]
    ClosedBeforeCredential,

    #[error("pairing code request failed: {0}")]
    PairingCode(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("send failed: {0}")]
    Send(anyhow::Error),

    #[error("history fetch failed: {0}")]
    History(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
