use std::io::{Read, Seek, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BlockingInput, StreamBridge};
use crate::error::{CaptureError, Result};

/// How captured frames are handed to the encoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// rgb24 raw video, one frame after another.
    #[default]
    Raw,
    /// A sequence of png stills.
    Png,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Gif,
    Mpg,
    Raw,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "video/mp4",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Mpg => "video/mpeg",
            OutputFormat::Raw => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Gif => "gif",
            OutputFormat::Mpg => "mpg",
            OutputFormat::Raw => "raw",
        }
    }
}

/// Everything the encoder needs to know about the stream it is about to read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames: u64,
    pub src_format: SourceFormat,
    pub format: OutputFormat,
    pub quality: String,
}

pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek> WriteSeek for T {}

/// A synchronous, run-once batch encoder. It reads the whole input until end
/// of stream and writes (and possibly rewrites) its output before returning.
pub trait EncodingEngine: Send {
    fn run(
        &mut self,
        job: &EncodeJob,
        input: &mut dyn Read,
        output: &mut dyn WriteSeek,
    ) -> anyhow::Result<()>;
}

/// Copies the input stream to the output untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEngine;

impl EncodingEngine for PassthroughEngine {
    fn run(
        &mut self,
        job: &EncodeJob,
        input: &mut dyn Read,
        output: &mut dyn WriteSeek,
    ) -> anyhow::Result<()> {
        let copied = std::io::copy(input, output)?;
        log::debug!(
            "passthrough copied {} bytes for {}x{} x{} frames",
            copied,
            job.width,
            job.height,
            job.frames
        );
        Ok(())
    }
}

/// Runs `engine` on a blocking thread against `bridge`. Resolves to the
/// finished output, or to the engine's error.
pub fn spawn_engine(
    mut engine: Box<dyn EncodingEngine>,
    job: EncodeJob,
    bridge: StreamBridge,
    cancel: CancellationToken,
) -> JoinHandle<Result<Bytes>> {
    tokio::task::spawn_blocking(move || {
        log::info!(
            "encoder start: {}x{}@{}fps, {} frames -> {:?} ({})",
            job.width,
            job.height,
            job.fps,
            job.frames,
            job.format,
            job.quality
        );
        let mut input = BlockingInput::new(bridge.input(), cancel);
        let mut output = bridge.output();
        output.open()?;
        let result = engine.run(&job, &mut input, &mut output);
        output.close();

        if let Err(e) = result {
            log::error!("encoder failed: {:#}", e);
            return Err(CaptureError::Engine {
                reason: format!("{:#}", e),
            });
        }
        let data = bridge.finish()?;
        log::info!(
            "encoder finished: {} bytes read, {} bytes written",
            bridge.bytes_read(),
            data.len()
        );
        Ok(data)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_types() {
        assert_eq!(OutputFormat::Mp4.mime(), "video/mp4");
        assert_eq!(OutputFormat::Gif.mime(), "image/gif");
        assert_eq!(OutputFormat::Mpg.mime(), "video/mpeg");
        assert_eq!(OutputFormat::Raw.mime(), "application/octet-stream");
    }

    #[test]
    fn test_formats_deserialize_lowercase() {
        let format: OutputFormat = serde_json::from_str("\"gif\"").unwrap();
        assert_eq!(format, OutputFormat::Gif);
        let src: SourceFormat = serde_json::from_str("\"png\"").unwrap();
        assert_eq!(src, SourceFormat::Png);
    }
}
