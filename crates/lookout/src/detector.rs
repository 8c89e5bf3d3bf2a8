//! The [`Detector`] interface and the data it produces.
//!
//! A detector turns one [`Frame`] into a list of labeled [`Region`]s. Detectors are assumed to be
//! expensive to construct and not thread-safe, so every worker builds and owns its own instance.

pub mod ssd;

use std::fmt;

use crate::{
    image::{Color, Frame, PixelLayout},
    timer::Timer,
};

/// An object detector.
///
/// Implementations do not need to be [`Send`]: the worker pool constructs each detector on the
/// thread that will use it.
pub trait Detector {
    /// The pixel layout [`Detector::detect`] expects.
    ///
    /// Workers convert frames to this layout before handing them to the detector.
    fn input_layout(&self) -> PixelLayout {
        PixelLayout::Rgb8
    }

    /// Runs detection on a single frame.
    ///
    /// The returned regions should be ordered the way the detector ranks them (typically by
    /// descending confidence). Consumers draw them in that order.
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Detections>;

    /// Timers measuring the stages of [`Detector::detect`], logged periodically by the worker.
    fn timers(&self) -> Vec<&Timer> {
        Vec::new()
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn input_layout(&self) -> PixelLayout {
        (**self).input_layout()
    }

    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Detections> {
        (**self).detect(frame)
    }

    fn timers(&self) -> Vec<&Timer> {
        (**self).timers()
    }
}

/// An axis-aligned bounding box in normalized coordinates.
///
/// All coordinates are fractions of the frame size, so `(0.0, 0.0)` is the top left corner of the
/// frame and `(1.0, 1.0)` the bottom right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// A single detected object.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    bbox: BoundingBox,
    label: String,
    confidence: f32,
    color: Color,
}

impl Region {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, confidence: f32, color: Color) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
            color,
        }
    }

    #[inline]
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Returns the text to display next to the bounding box.
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the detection confidence in range 0.0 to 1.0.
    #[inline]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Returns the color used to draw this region.
    #[inline]
    pub fn color(&self) -> Color {
        self.color
    }
}

/// The ordered list of regions a detector found in one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    regions: Vec<Region>,
}

impl Detections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns an iterator over the regions, in detector order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

impl FromIterator<Region> for Detections {
    fn from_iter<T: IntoIterator<Item = Region>>(iter: T) -> Self {
        Self {
            regions: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Detections {
    type Item = &'a Region;
    type IntoIter = std::slice::Iter<'a, Region>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}

/// What a worker publishes on the result queue for every successfully processed frame.
pub struct DetectionResult {
    seq: u64,
    worker: usize,
    detections: Detections,
    frame: Option<Frame>,
}

impl DetectionResult {
    pub(crate) fn new(
        seq: u64,
        worker: usize,
        detections: Detections,
        frame: Option<Frame>,
    ) -> Self {
        Self {
            seq,
            worker,
            detections,
            frame,
        }
    }

    /// Returns the capture sequence number of the frame this result was computed from.
    ///
    /// Sequence numbers start at 0 and increase by one for every frame submitted to the pipeline.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the index of the worker that produced this result.
    #[inline]
    pub fn worker(&self) -> usize {
        self.worker
    }

    #[inline]
    pub fn detections(&self) -> &Detections {
        &self.detections
    }

    /// Returns the frame this result was computed from, if the pipeline was configured to attach
    /// it ([`OverlayTarget::SourceFrame`][crate::config::OverlayTarget::SourceFrame]).
    #[inline]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }
}

impl fmt::Debug for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionResult")
            .field("seq", &self.seq)
            .field("worker", &self.worker)
            .field("detections", &self.detections.len())
            .field("frame", &self.frame.is_some())
            .finish()
    }
}
