use capture_bus::{FrameSource, Result};

/// Animated diagonal gradient, one step per readback.
#[derive(Debug, Default)]
pub struct GradientSource {
    tick: u32,
}

impl GradientSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSource for GradientSource {
    fn read_pixels(&mut self, width: u32, height: u32, dst: &mut [u8]) -> Result<()> {
        let shift = self.tick.wrapping_mul(4);
        for (i, px) in dst.chunks_exact_mut(4).enumerate() {
            let x = i as u32 % width.max(1);
            let y = i as u32 / width.max(1);
            px[0] = ((x * 255 / width.max(1)).wrapping_add(shift) & 0xff) as u8;
            px[1] = ((y * 255 / height.max(1)).wrapping_add(shift) & 0xff) as u8;
            px[2] = (((x + y) / 2).wrapping_sub(shift) & 0xff) as u8;
            px[3] = 255;
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_change_between_ticks() {
        let mut source = GradientSource::new();
        let mut first = vec![0u8; 8 * 4 * 4];
        let mut second = vec![0u8; 8 * 4 * 4];
        source.read_pixels(8, 4, &mut first).unwrap();
        source.read_pixels(8, 4, &mut second).unwrap();
        assert_ne!(first, second);
        assert!(first.chunks_exact(4).all(|px| px[3] == 255));
    }
}
