//! Stream-processor error taxonomy (§7).

use thiserror::Error;

use crate::filesystem::FilesystemError;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("tag parse error: {0}")]
    TagParse(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

pub type StreamResult<T> = Result<T, StreamError>;
