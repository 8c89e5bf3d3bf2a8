//! Drawing detection results and handing them to a [`Sink`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::{
    config::{OverlayTarget, PipelineConfig},
    detector::{BoundingBox, DetectionResult, Detections},
    image::{
        draw::{self, text_height, text_width},
        Color, Frame, Image, Rect, Resolution,
    },
};

const BOX_STROKE_WIDTH: u32 = 3;

/// A bounding box in pixel coordinates. Both corners are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

/// Scales a normalized bounding box to `resolution`.
///
/// Coordinates are truncated towards zero, so `{0.1, 0.2, 0.5, 0.8}` at 640x480 becomes
/// `(64, 96)`-`(320, 384)`.
pub fn scale_bbox(bbox: &BoundingBox, resolution: Resolution) -> PixelRect {
    let (w, h) = (
        f64::from(resolution.width()),
        f64::from(resolution.height()),
    );
    let scale = |norm: f32, size: f64| (f64::from(norm) * size) as i32;
    PixelRect {
        x0: scale(bbox.xmin, w),
        y0: scale(bbox.ymin, h),
        x1: scale(bbox.xmax, w),
        y1: scale(bbox.ymax, h),
    }
}

/// Draws detection results onto frames.
#[derive(Debug, Clone)]
pub struct Renderer {
    resolution: Resolution,
    overlay: OverlayTarget,
}

impl Renderer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            resolution: config.get_resolution(),
            overlay: config.get_overlay(),
        }
    }

    /// Draws `result` onto a copy of the frame selected by the overlay target.
    ///
    /// With [`OverlayTarget::LatestCapture`], or if `result` carries no frame, that is `latest`.
    pub fn annotate(&self, latest: &Frame, result: &DetectionResult) -> Image {
        let base = match (self.overlay, result.frame()) {
            (OverlayTarget::SourceFrame, Some(frame)) => frame,
            _ => latest,
        };
        let mut image = base.to_image();
        self.draw(&mut image, result.detections());
        image
    }

    /// Draws every region in `detections`, in order, onto `image`.
    ///
    /// Coordinates are scaled by the configured resolution, not by the size of `image`.
    pub fn draw(&self, image: &mut Image, detections: &Detections) {
        for region in detections {
            let r = scale_bbox(region.bbox(), self.resolution);
            let color = region.color();

            draw::rect(image, Rect::from_corners((r.x0, r.y0), (r.x1, r.y1)))
                .color(color)
                .stroke_width(BOX_STROKE_WIDTH);

            let label = region.label();
            let label_bg = Rect::from_corners(
                (r.x0, r.y0 - text_height() as i32),
                (r.x0 + text_width(label) as i32, r.y0),
            );
            draw::filled_rect(image, label_bg).color(color);
            draw::text(image, r.x0, r.y0, label).color(Color::BLACK);
        }
    }
}

/// Receives rendered frames.
pub trait Sink {
    /// Consumes the frame rendered for the result with sequence number `seq`.
    ///
    /// Errors end the session.
    fn consume(&mut self, seq: u64, image: &Image) -> anyhow::Result<()>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn consume(&mut self, seq: u64, image: &Image) -> anyhow::Result<()> {
        (**self).consume(seq, image)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn consume(&mut self, seq: u64, image: &Image) -> anyhow::Result<()> {
        (**self).consume(seq, image)
    }
}

/// A [`Sink`] that only logs what it receives.
#[derive(Debug, Default)]
pub struct LogSink {
    count: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of frames consumed.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Sink for LogSink {
    fn consume(&mut self, seq: u64, image: &Image) -> anyhow::Result<()> {
        self.count += 1;
        log::debug!("rendered frame {seq} ({})", image.resolution());
        Ok(())
    }
}

/// A [`Sink`] that saves every frame as a PNG file named `frame-{seq}.png`.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Creates the sink, creating `dir` if it doesn't exist.
    pub fn new<P: Into<PathBuf>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory '{}'", dir.display()))?;
        log::info!("writing frames to '{}'", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path the frame with sequence number `seq` is written to.
    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("frame-{seq:06}.png"))
    }
}

impl Sink for DirectorySink {
    fn consume(&mut self, seq: u64, image: &Image) -> anyhow::Result<()> {
        let path = self.path_for(seq);
        image
            .save(&path)
            .with_context(|| format!("failed to write '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detector::Region,
        image::{PixelLayout, Resolution},
    };

    const BOX_COLOR: Color = Color::from_rgb8(255, 0, 255);

    fn gray_frame(res: Resolution, level: u8) -> Frame {
        let len = res.num_pixels() as usize * 3;
        Frame::new(res, PixelLayout::Rgb8, vec![level; len]).unwrap()
    }

    fn result_with(seq: u64, label: &str, frame: Option<Frame>) -> DetectionResult {
        let detections = [Region::new(
            BoundingBox::new(0.1, 0.2, 0.5, 0.8),
            label,
            0.87,
            BOX_COLOR,
        )]
        .into_iter()
        .collect();
        DetectionResult::new(seq, 0, detections, frame)
    }

    #[test]
    fn scales_by_configured_resolution() {
        let bbox = BoundingBox::new(0.1, 0.2, 0.5, 0.8);
        assert_eq!(
            scale_bbox(&bbox, Resolution::new(640, 480)),
            PixelRect {
                x0: 64,
                y0: 96,
                x1: 320,
                y1: 384
            }
        );

        // Truncated, not rounded.
        let bbox = BoundingBox::new(0.999, 0.0, 1.0, 0.0015);
        let r = scale_bbox(&bbox, Resolution::new(640, 480));
        assert_eq!((r.x0, r.x1, r.y1), (639, 640, 0));
    }

    #[test]
    fn draws_box_and_label() {
        let config = PipelineConfig::default();
        let renderer = Renderer::new(&config);
        let frame = gray_frame(Resolution::new(640, 480), 128);
        let gray = Color::from_rgb8(128, 128, 128);

        let image = renderer.annotate(&frame, &result_with(0, "person: 87%", None));

        // Box outline, all four edges.
        assert_eq!(image.get(64, 240), BOX_COLOR);
        assert_eq!(image.get(320, 240), BOX_COLOR);
        assert_eq!(image.get(192, 384), BOX_COLOR);
        assert_eq!(image.get(192, 96), BOX_COLOR);
        // The stroke is 3 pixels wide, centered on the edge.
        assert_eq!(image.get(68, 240), gray);
        assert_eq!(image.get(59, 240), gray);
        // Inside is untouched.
        assert_eq!(image.get(192, 240), gray);

        // Label background spans 6 pixels per character, 10 pixels above the box.
        assert_eq!(image.get(64 + 66, 91), BOX_COLOR);
        assert_eq!(image.get(64 + 68, 91), gray);
        assert_eq!(image.get(100, 96 - 12), gray);
        let black = (64..130)
            .flat_map(|x| (86..97).map(move |y| (x, y)))
            .filter(|&(x, y)| image.get(x, y) == Color::BLACK)
            .count();
        assert!(black > 0, "label text is missing");

        // The source frame is left alone.
        assert_eq!(frame.data()[0], 128);
    }

    #[test]
    fn overlay_target_selects_frame() {
        let res = Resolution::new(64, 48);
        let latest = gray_frame(res, 10);
        let source = gray_frame(res, 200);
        let result = result_with(3, "x", Some(source));

        let config = PipelineConfig::default().resolution(res);
        let live = Renderer::new(&config).annotate(&latest, &result);
        assert_eq!(live.get(20, 24), Color::from_rgb8(10, 10, 10));

        let config = config.overlay(OverlayTarget::SourceFrame);
        let strict = Renderer::new(&config).annotate(&latest, &result);
        assert_eq!(strict.get(20, 24), Color::from_rgb8(200, 200, 200));

        // Without an attached frame, the latest capture is used.
        let bare = Renderer::new(&config).annotate(&latest, &result_with(4, "x", None));
        assert_eq!(bare.get(20, 24), Color::from_rgb8(10, 10, 10));
    }

    #[test]
    fn regions_are_drawn_in_order() {
        let res = Resolution::new(100, 100);
        let config = PipelineConfig::default().resolution(res);
        let bbox = BoundingBox::new(0.2, 0.2, 0.6, 0.6);
        let detections: Detections = [
            Region::new(bbox, "a", 0.9, Color::RED),
            Region::new(bbox, "b", 0.8, Color::BLUE),
        ]
        .into_iter()
        .collect();

        let mut image = gray_frame(res, 0).to_image();
        Renderer::new(&config).draw(&mut image, &detections);
        // The later region is drawn on top.
        assert_eq!(image.get(20, 50), Color::BLUE);
    }

    #[test]
    fn directory_sink_writes_png() {
        let dir = std::env::temp_dir().join(format!("lookout-sink-{}", fastrand::u64(..)));
        let mut sink = DirectorySink::new(&dir).unwrap();
        let image = gray_frame(Resolution::new(8, 8), 50).to_image();
        sink.consume(42, &image).unwrap();

        let path = sink.path_for(42);
        assert!(path.ends_with("frame-000042.png"));
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
