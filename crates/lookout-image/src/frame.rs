use std::{fmt, sync::Arc};

use anyhow::bail;
use image::{ImageBuffer, RgbImage};

use crate::{Image, Resolution};

/// Channel order and count of a [`Frame`]'s pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 3 bytes per pixel, red first.
    Rgb8,
    /// 3 bytes per pixel, blue first. This is what many capture APIs hand out.
    Bgr8,
    /// 4 bytes per pixel, red first, alpha last.
    Rgba8,
}

impl PixelLayout {
    /// Returns the number of bytes each pixel occupies.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Rgb8 | PixelLayout::Bgr8 => 3,
            PixelLayout::Rgba8 => 4,
        }
    }

    #[inline]
    fn rgba_at(self, px: &[u8]) -> [u8; 4] {
        match self {
            PixelLayout::Rgb8 => [px[0], px[1], px[2], 255],
            PixelLayout::Bgr8 => [px[2], px[1], px[0], 255],
            PixelLayout::Rgba8 => [px[0], px[1], px[2], px[3]],
        }
    }

    #[inline]
    fn write_rgba(self, rgba: [u8; 4], out: &mut Vec<u8>) {
        match self {
            PixelLayout::Rgb8 => out.extend_from_slice(&rgba[..3]),
            PixelLayout::Bgr8 => out.extend_from_slice(&[rgba[2], rgba[1], rgba[0]]),
            PixelLayout::Rgba8 => out.extend_from_slice(&rgba),
        }
    }
}

/// An immutable captured video frame.
///
/// Cloning a [`Frame`] is cheap: the pixel buffer is reference-counted and never mutated after
/// construction. Drawing requires converting the frame to an owned [`Image`] first.
#[derive(Clone)]
pub struct Frame {
    resolution: Resolution,
    layout: PixelLayout,
    data: Arc<[u8]>,
}

impl Frame {
    /// Creates a frame from tightly packed, row-major pixel data.
    ///
    /// Returns an error if `data` does not hold exactly `width * height` pixels of `layout`.
    pub fn new(resolution: Resolution, layout: PixelLayout, data: Vec<u8>) -> anyhow::Result<Self> {
        let expected = resolution.num_pixels() as usize * layout.bytes_per_pixel();
        if data.len() != expected {
            bail!(
                "incorrect buffer size {} for {} {:?} frame (expected {} bytes)",
                data.len(),
                resolution,
                layout,
                expected,
            );
        }

        Ok(Self {
            resolution,
            layout,
            data: data.into(),
        })
    }

    /// Creates an `Rgb8` frame from a decoded RGB image.
    pub fn from_rgb_image(image: RgbImage) -> Self {
        let resolution = Resolution::new(image.width(), image.height());
        Self {
            resolution,
            layout: PixelLayout::Rgb8,
            data: image.into_raw().into(),
        }
    }

    /// Creates a black `Rgb8` frame.
    pub fn blank(resolution: Resolution) -> Self {
        let len = resolution.num_pixels() as usize * 3;
        Self {
            resolution,
            layout: PixelLayout::Rgb8,
            data: vec![0; len].into(),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.resolution.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.resolution.height()
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Returns the raw, tightly packed pixel data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a frame with the same contents in `layout`.
    ///
    /// If the frame already uses `layout`, this only clones the handle.
    pub fn to_layout(&self, layout: PixelLayout) -> Frame {
        if layout == self.layout {
            return self.clone();
        }

        let src_bpp = self.layout.bytes_per_pixel();
        let mut data =
            Vec::with_capacity(self.resolution.num_pixels() as usize * layout.bytes_per_pixel());
        for px in self.data.chunks_exact(src_bpp) {
            layout.write_rgba(self.layout.rgba_at(px), &mut data);
        }

        Frame {
            resolution: self.resolution,
            layout,
            data: data.into(),
        }
    }

    /// Converts this frame to an `RgbImage`, copying the pixel data.
    pub fn to_rgb_image(&self) -> RgbImage {
        let rgb = self.to_layout(PixelLayout::Rgb8);
        ImageBuffer::from_raw(self.width(), self.height(), rgb.data.to_vec())
            .expect("frame buffer size is validated on construction")
    }

    /// Converts this frame to an owned RGBA [`Image`] that can be drawn on.
    pub fn to_image(&self) -> Image {
        let rgba = self.to_layout(PixelLayout::Rgba8);
        Image::from_rgba8(self.resolution, &rgba.data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
