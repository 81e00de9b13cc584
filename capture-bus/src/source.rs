use crate::error::{CaptureError, Result};

/// The real-time surface frames are read back from.
pub trait FrameSource: Send {
    /// Reads the current surface as tightly packed RGBA into `dst`, which is
    /// exactly `width * height * 4` bytes.
    fn read_pixels(&mut self, width: u32, height: u32, dst: &mut [u8]) -> Result<()>;

    /// Encodes the current surface as a png still.
    fn snapshot_png(&mut self, width: u32, height: u32) -> Result<Vec<u8>> {
        let _ = (width, height);
        Err(CaptureError::source_failure(
            "png snapshots are not supported by this source",
            false,
        ))
    }
}

impl<F> FrameSource for F
where
    F: FnMut(u32, u32, &mut [u8]) -> Result<()> + Send,
{
    fn read_pixels(&mut self, width: u32, height: u32, dst: &mut [u8]) -> Result<()> {
        self(width, height, dst)
    }
}
