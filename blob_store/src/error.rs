//! Error types for blob store operations.

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {key}")]
    NotFound { key: String },

    #[error("invalid blob storage url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("object store error on '{key}': {source}")]
    ObjectStore {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("error reading input stream for '{key}': {source}")]
    InputStream {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BlobError {
    pub fn object_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.to_string(),
            },
            source => BlobError::ObjectStore {
                key: key.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl From<url::ParseError> for BlobError {
    fn from(err: url::ParseError) -> Self {
        BlobError::InvalidUrl {
            url: String::new(),
            reason: err.to_string(),
        }
    }
}
