//! Synthetic source producing an animated gradient.

use crate::OurResult;
use crate::frame::{RGB_CHANNELS, RawFrame};

use super::FrameSource;

pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_number: u32,
    open: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_number: 0,
            open: false,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn open(&mut self) -> OurResult<()> {
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> OurResult<RawFrame> {
        let (width, height) = (self.width as usize, self.height as usize);
        let shift = self.frame_number as usize;
        self.frame_number = self.frame_number.wrapping_add(1);

        let mut pixels = Vec::with_capacity(width * height * RGB_CHANNELS);
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) * 255 / width.max(1)) as u8);
                pixels.push((y * 255 / height.max(1)) as u8);
                pixels.push((shift * 4 % 256) as u8);
            }
        }
        Ok(RawFrame::new(self.width, self.height, pixels))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
