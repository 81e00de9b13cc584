use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to allocate {bytes} bytes for a frame buffer")]
    Allocation { bytes: usize },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// No data yet, the reader is expected to retry.
    #[error("no data available yet")]
    WouldBlock,

    #[error("frame source failed: {reason}")]
    FrameSource { reason: String, recoverable: bool },

    #[error("encoding engine failed: {reason}")]
    Engine { reason: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("configuration invalid: {reason}")]
    InvalidConfig { reason: String },

    #[error("stream aborted: {reason}")]
    Aborted { reason: String },

    #[error("relay channel closed")]
    RelayClosed,

    #[error("session cancelled")]
    Cancelled,
}

impl CaptureError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn source_failure(reason: impl Into<String>, recoverable: bool) -> Self {
        Self::FrameSource {
            reason: reason.into(),
            recoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock
                | Self::FrameSource {
                    recoverable: true,
                    ..
                }
        )
    }
}

impl From<CaptureError> for std::io::Error {
    fn from(err: CaptureError) -> Self {
        let kind = match &err {
            CaptureError::WouldBlock => std::io::ErrorKind::WouldBlock,
            CaptureError::Protocol { .. } => std::io::ErrorKind::InvalidInput,
            CaptureError::Allocation { .. } => std::io::ErrorKind::OutOfMemory,
            CaptureError::Aborted { .. } | CaptureError::Cancelled => {
                std::io::ErrorKind::BrokenPipe
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
