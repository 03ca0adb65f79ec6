//! Session enforcement error types.

use thiserror::Error;

/// Errors surfaced by session operations and collaborator clients.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The targeted session does not exist (or no longer exists).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A recorded update could not be merged onto the stored session;
    /// the caller must discard its in-memory copy and reload.
    #[error("update criteria merge conflict for session {0}")]
    MergeConflict(String),

    /// The upstream policy/charging controller could not be reached or
    /// rejected the request at the transport level.
    #[error("upstream reporter failure: {0}")]
    Upstream(String),

    /// A downstream client (pipeline, directory, access network) failed.
    #[error("downstream client failure: {0}")]
    Downstream(String),

    /// A final-unit action could not be installed in a valid way.
    #[error("invalid final unit state: {0}")]
    InvalidFinalUnitState(String),

    /// The session store rejected the operation.
    #[error("session store rejected the operation: {0}")]
    Store(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
