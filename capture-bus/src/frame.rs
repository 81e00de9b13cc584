use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::error::{CaptureError, Result};

/// Bytes per pixel of frames read back from a frame source.
pub const RGBA_DEPTH: u32 = 4;
/// Bytes per pixel of frames handed to the encoder (rgb24).
pub const RGB_DEPTH: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Shape {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn rgba(width: u32, height: u32) -> Self {
        Self::new(width, height, RGBA_DEPTH)
    }

    pub fn rgb(width: u32, height: u32) -> Self {
        Self::new(width, height, RGB_DEPTH)
    }

    /// Buffer length in bytes, `None` if it does not fit in `usize`.
    pub fn byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.depth as usize)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}bpp", self.width, self.height, self.depth * 8)
    }
}

/// Identifies the pool (and pool generation) a frame was allocated by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolTag {
    pub pool_id: u64,
    pub generation: u64,
}

/// One contiguous pixel buffer plus its shape.
///
/// A `Frame` is not `Clone`: handing it to a pool, a bridge or
/// the relay moves the buffer, so the previous owner can no longer reach it.
///
/// ```compile_fail
/// use capture_bus::frame::{Frame, Shape};
///
/// let frame = Frame::new(Shape::rgba(2, 2)).unwrap();
/// let (tx, _rx) = std::sync::mpsc::channel();
/// tx.send(frame).unwrap();
/// // the buffer was transferred with the send
/// let _ = frame.data();
/// ```
pub struct Frame {
    shape: Shape,
    buffer: Vec<u8>,
    tag: Option<PoolTag>,
}

impl Frame {
    /// Allocates a zeroed frame of the given shape.
    pub fn new(shape: Shape) -> Result<Self> {
        let bytes = shape.byte_len().ok_or(CaptureError::Allocation { bytes: usize::MAX })?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| CaptureError::Allocation { bytes })?;
        buffer.resize(bytes, 0);
        Ok(Self {
            shape,
            buffer,
            tag: None,
        })
    }

    /// Wraps externally supplied pixel data, e.g. a canvas snapshot.
    pub fn from_vec(width: u32, height: u32, depth: u32, buffer: Vec<u8>) -> Result<Self> {
        let shape = Shape::new(width, height, depth);
        if shape.byte_len() != Some(buffer.len()) {
            return Err(CaptureError::InvalidFrame {
                reason: format!("buffer of {} bytes does not match {}", buffer.len(), shape),
            });
        }
        Ok(Self {
            shape,
            buffer,
            tag: None,
        })
    }

    pub(crate) fn with_tag(mut self, tag: PoolTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn depth(&self) -> u32 {
        self.shape.depth
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn tag(&self) -> Option<PoolTag> {
        self.tag
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Address of the underlying allocation, stable across moves.
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Drops the alpha channel of an RGBA frame into an RGB frame of the same
    /// dimensions (interleaved rgb24).
    pub fn strip_alpha_into(&self, dst: &mut Frame) -> Result<()> {
        if self.depth() != RGBA_DEPTH || dst.depth() != RGB_DEPTH {
            return Err(CaptureError::InvalidFrame {
                reason: format!("cannot strip alpha from {} into {}", self.shape, dst.shape),
            });
        }
        if self.width() != dst.width() || self.height() != dst.height() {
            return Err(CaptureError::InvalidFrame {
                reason: format!("dimension mismatch: {} vs {}", self.shape, dst.shape),
            });
        }
        for (src, out) in self
            .buffer
            .chunks_exact(RGBA_DEPTH as usize)
            .zip(dst.buffer.chunks_exact_mut(RGB_DEPTH as usize))
        {
            out.copy_from_slice(&src[..3]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("len", &self.buffer.len())
            .field("tag", &self.tag)
            .finish()
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {} data_len: {}", self.shape, self.buffer.len())
    }
}

/// What a capture tick produces: raw pixels, or an already encoded still
/// image when the source format is png.
#[derive(Debug)]
pub enum CapturedFrame {
    Pixels(Frame),
    Encoded(Bytes),
}

impl CapturedFrame {
    pub fn len(&self) -> usize {
        match self {
            CapturedFrame::Pixels(frame) => frame.len(),
            CapturedFrame::Encoded(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Frame> for CapturedFrame {
    fn from(frame: Frame) -> Self {
        Self::Pixels(frame)
    }
}
