use serde::{Deserialize, Serialize};

use crate::bridge::DEFAULT_OUTPUT_BLOCK;
use crate::engine::{OutputFormat, SourceFormat};
use crate::error::{CaptureError, Result};
use crate::frame::Shape;

/// Largest recorded side in pixels.
pub const MAX_DIMENSION: u32 = 16384;

/// Settings of one recording. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    /// Bounding box the requested size is scaled into; `None` keeps the
    /// requested size (rounded down to even dimensions).
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub fps: u32,
    /// Recording length in seconds.
    pub time: f64,
    #[serde(rename = "srcformat", alias = "src_format")]
    pub src_format: SourceFormat,
    pub format: OutputFormat,
    pub quality: String,
    /// Run the encoder behind the context relay instead of inline.
    #[serde(alias = "useWorker")]
    pub use_relay: bool,
    pub tick_retries: u32,
    pub output_block_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            max_width: None,
            max_height: None,
            fps: 25,
            time: 5.0,
            src_format: SourceFormat::Raw,
            format: OutputFormat::Mp4,
            quality: "ultrafast".to_string(),
            use_relay: true,
            tick_retries: 2,
            output_block_size: DEFAULT_OUTPUT_BLOCK,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(invalid("fps must be positive"));
        }
        if !(self.time.is_finite() && self.time > 0.0) {
            return Err(invalid(format!("time must be positive, got {}", self.time)));
        }
        let (width, height) = self.scaled_size();
        if width == 0 || height == 0 {
            return Err(invalid(format!(
                "{}x{} scales to an empty {}x{} frame",
                self.width, self.height, width, height
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(invalid(format!(
                "{}x{} exceeds the {} pixel limit per side",
                width, height, MAX_DIMENSION
            )));
        }
        if Shape::rgba(width, height).byte_len().is_none() {
            return Err(invalid(format!("{}x{} frame does not fit in memory", width, height)));
        }
        Ok(())
    }

    /// Frame size actually recorded.
    pub fn scaled_size(&self) -> (u32, u32) {
        let max = (
            self.max_width.unwrap_or(self.width),
            self.max_height.unwrap_or(self.height),
        );
        scaled_size((self.width, self.height), max, 2)
    }

    pub fn expected_frames(&self) -> u64 {
        (self.fps as f64 * self.time).ceil() as u64
    }
}

fn invalid(reason: impl Into<String>) -> CaptureError {
    CaptureError::InvalidConfig {
        reason: reason.into(),
    }
}

/// Fits `size` into `max` keeping the aspect ratio, rounding each side down
/// to a multiple of `multiple`.
pub fn scaled_size(size: (u32, u32), max: (u32, u32), multiple: u32) -> (u32, u32) {
    if size.0 == 0 || size.1 == 0 {
        return (0, 0);
    }
    let multiple = multiple.max(1) as f64;
    let scale = (max.0 as f64 / size.0 as f64).min(max.1 as f64 / size.1 as f64);
    let fit = |side: u32| ((side as f64 * scale / multiple).floor() * multiple) as u32;
    (fit(size.0), fit(size.1))
}
