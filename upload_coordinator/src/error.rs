pub type UploadResult<T> = Result<T, UploadError>;

/// Broad classes of failure, so callers can tell a bad request from a
/// conflicting one and a local storage failure from a remote transfer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientInput,
    Conflict,
    Storage,
    RemoteTransfer,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    #[error("invalid request: {reason}")]
    InvalidInput { reason: String },

    #[error("session {session} was started with {established} chunks, got {declared}")]
    TotalMismatch {
        session: String,
        established: u32,
        declared: u32,
    },

    #[error("chunk index {index} is outside [0, {bound}) for session {session}")]
    IndexOutOfRange {
        session: String,
        index: u32,
        bound: u32,
    },

    #[error("session not found: {session}")]
    SessionNotFound { session: String },

    #[error("session {session} is missing chunks {missing:?}")]
    Incomplete { session: String, missing: Vec<u32> },

    #[error("session {session} is already being finalized")]
    FinalizeInProgress { session: String },

    #[error("session {session} is closed")]
    SessionClosed { session: String },

    #[error("chunk {index} of session {session} is missing from the chunk store")]
    ChunkMissing { session: String, index: u32 },

    #[error("storage error while trying to {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote transfer error while trying to {operation}: {source}")]
    RemoteTransfer {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl UploadError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        UploadError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        UploadError::Storage {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn remote(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        UploadError::RemoteTransfer {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::InvalidInput { .. }
            | UploadError::TotalMismatch { .. }
            | UploadError::IndexOutOfRange { .. }
            | UploadError::SessionNotFound { .. } => ErrorKind::ClientInput,
            UploadError::Incomplete { .. }
            | UploadError::FinalizeInProgress { .. }
            | UploadError::SessionClosed { .. } => ErrorKind::Conflict,
            UploadError::ChunkMissing { .. } | UploadError::Storage { .. } => ErrorKind::Storage,
            UploadError::RemoteTransfer { .. } => ErrorKind::RemoteTransfer,
        }
    }
}
