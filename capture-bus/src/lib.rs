//! Frame capture plumbing: pooled frame buffers, a capture scheduler, and a
//! pull/push bridge that feeds a synchronous batch encoder, either inline or
//! behind a message relay.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod host;
pub mod pool;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod source;

pub use config::SessionConfig;
pub use engine::{EncodeJob, EncodingEngine, OutputFormat, PassthroughEngine, SourceFormat};
pub use error::{CaptureError, Result};
pub use frame::{CapturedFrame, Frame, Shape};
pub use session::{CaptureSession, Recording, SessionState};
pub use source::FrameSource;
