//! Generated frames, for tests and benchmarks without a camera.

use std::{
    thread,
    time::{Duration, Instant},
};

use image::{Rgb, RgbImage};

use crate::image::{Frame, PixelLayout, Resolution};

use super::FrameSource;

/// Produces a fixed number of frames, optionally paced at a fixed rate.
///
/// Frame `n` shows a diagonal gradient that moves by one pixel per frame. Its first pixel is set
/// to `n % 256` in every channel, so the first byte of the frame identifies it in any layout.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    resolution: Resolution,
    layout: PixelLayout,
    frames: u64,
    interval: Option<Duration>,
    produced: u64,
    start: Option<Instant>,
}

impl SyntheticSource {
    /// Creates a source emitting `frames` `Rgb8` frames as fast as they are read.
    pub fn new(resolution: Resolution, frames: u64) -> Self {
        Self {
            resolution,
            layout: PixelLayout::Rgb8,
            frames,
            interval: None,
            produced: 0,
            start: None,
        }
    }

    /// Paces the source to emit `fps` frames per second. 0 disables pacing.
    pub fn fps(self, fps: u32) -> Self {
        Self {
            interval: (fps > 0).then(|| Duration::from_secs(1) / fps),
            ..self
        }
    }

    /// Sets the pixel layout of the emitted frames.
    pub fn layout(self, layout: PixelLayout) -> Self {
        Self { layout, ..self }
    }

    /// Returns the number of frames emitted so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn generate(&self, n: u64) -> Frame {
        let tag = n as u8;
        let image = RgbImage::from_fn(self.resolution.width(), self.resolution.height(), |x, y| {
            if (x, y) == (0, 0) {
                return Rgb([tag; 3]);
            }
            let v = (u64::from(x) + u64::from(y) + n) as u8;
            Rgb([v, v.wrapping_mul(2), 255 - v])
        });
        Frame::from_rgb_image(image).to_layout(self.layout)
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.produced >= self.frames {
            return Ok(None);
        }

        let start = *self.start.get_or_insert_with(Instant::now);
        if let Some(interval) = self.interval {
            // Pace against the start time so sleep overshoot doesn't accumulate.
            let due = start + interval * self.produced as u32;
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }

        let frame = self.generate(self.produced);
        self.produced += 1;
        Ok(Some(frame))
    }

    fn stop(&mut self) {
        self.frames = self.produced;
    }
}
