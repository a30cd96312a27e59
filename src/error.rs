use std::io;

/// Failure kinds of the capture-reading surface. Per-record errors are caught
/// at the envelope walker, per-input errors at the dispatcher; neither is
/// allowed to cross the reload boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An expected field is absent or a variant tag is unknown. Fatal under
    /// strict mode, logged and skipped otherwise.
    #[error("schema deviation: {0}")]
    Schema(String),

    #[error("unrecognized media url: {0}")]
    UnrecognizedMediaUrl(String),

    /// Truncated or mis-framed archive record.
    #[error("corrupt capture: {0}")]
    CorruptCapture(String),

    /// HTTP-archive entry without an inline body or a hash reference.
    #[error("response body missing for {0}")]
    MissingBody(String),

    #[error("video remux failed: {0}")]
    Muxer(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptCapture(msg.into())
    }
}
