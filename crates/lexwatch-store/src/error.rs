use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The regulation was written by someone else since it was read.
    #[error("revision conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}
