//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at startup and handed by reference to every stage that
//! needs it (frame source, worker pool, renderer). Nothing reads configuration from global state.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure};

use crate::image::Resolution;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    /// A local capture device, identified by its index (`/dev/video{index}`).
    Device(u32),
    /// A remote MJPEG stream, identified by its URL.
    Stream(String),
    /// Generated frames, emitted at a fixed rate.
    Synthetic { frames: u64, fps: u32 },
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self::Device(0)
    }
}

/// Selects which frame a detection result is drawn onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayTarget {
    /// Draw onto the frame that was captured most recently.
    ///
    /// This gives a "live" overlay: the boxes may lag behind the picture by the inference latency,
    /// and with several workers, results can be drawn out of capture order.
    #[default]
    LatestCapture,
    /// Draw onto the frame the result was computed from.
    ///
    /// Workers hand their input frame back along with the result. Results are still rendered in
    /// the order they complete, not in capture order.
    SourceFrame,
}

/// What a worker does when its detector returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the error and move on to the next frame.
    Skip,
    /// Run the detector on the same frame one more time, then skip it if that fails too.
    #[default]
    RetryOnce,
}

/// Settings for constructing a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    model_path: PathBuf,
    labels_path: PathBuf,
    num_classes: u32,
    min_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/frozen_inference_graph.onnx"),
            labels_path: PathBuf::from("model/mscoco_label_map.pbtxt"),
            num_classes: 90,
            min_confidence: 0.5,
        }
    }
}

impl DetectorConfig {
    /// Sets the path to the ONNX model file.
    pub fn model_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: path.into(),
            ..self
        }
    }

    /// Sets the path to the label map (`.pbtxt`).
    pub fn labels_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            labels_path: path.into(),
            ..self
        }
    }

    /// Sets the number of classes the model distinguishes. Label map entries with higher ids are
    /// ignored.
    pub fn num_classes(self, num_classes: u32) -> Self {
        Self {
            num_classes,
            ..self
        }
    }

    /// Sets the minimum confidence score a detection needs to be reported.
    pub fn min_confidence(self, min_confidence: f32) -> Self {
        Self {
            min_confidence,
            ..self
        }
    }

    pub fn get_model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn get_labels_path(&self) -> &Path {
        &self.labels_path
    }

    pub fn get_num_classes(&self) -> u32 {
        self.num_classes
    }

    pub fn get_min_confidence(&self) -> f32 {
        self.min_confidence
    }
}

/// Immutable configuration of the whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    source: SourceSpec,
    resolution: Resolution,
    pool_size: usize,
    queue_capacity: usize,
    overlay: OverlayTarget,
    failure_policy: FailurePolicy,
    detector: DetectorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceSpec::default(),
            resolution: Resolution::RES_VGA,
            pool_size: 2,
            queue_capacity: 2,
            overlay: OverlayTarget::default(),
            failure_policy: FailurePolicy::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Sets the frame source.
    pub fn source(self, source: SourceSpec) -> Self {
        Self { source, ..self }
    }

    /// Sets the frame resolution.
    ///
    /// Capture devices are asked for this resolution, and the renderer scales normalized
    /// detection coordinates by it.
    pub fn resolution(self, resolution: Resolution) -> Self {
        Self { resolution, ..self }
    }

    /// Sets the number of worker threads (and thus detector instances).
    pub fn pool_size(self, pool_size: usize) -> Self {
        Self { pool_size, ..self }
    }

    /// Sets how many captured frames may wait for a free worker before capture blocks.
    ///
    /// A small capacity keeps processed frames fresh; a larger one keeps workers busy through
    /// capture hiccups at the cost of latency.
    pub fn queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    pub fn overlay(self, overlay: OverlayTarget) -> Self {
        Self { overlay, ..self }
    }

    pub fn failure_policy(self, failure_policy: FailurePolicy) -> Self {
        Self {
            failure_policy,
            ..self
        }
    }

    pub fn detector(self, detector: DetectorConfig) -> Self {
        Self { detector, ..self }
    }

    pub fn get_source(&self) -> &SourceSpec {
        &self.source
    }

    pub fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn get_queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn get_overlay(&self) -> OverlayTarget {
        self.overlay
    }

    pub fn get_failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn get_detector(&self) -> &DetectorConfig {
        &self.detector
    }

    /// Checks that the configuration describes a pipeline that can actually run.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.pool_size > 0, "worker pool size must be at least 1");
        ensure!(
            self.queue_capacity > 0,
            "input queue capacity must be at least 1"
        );
        ensure!(
            !self.resolution.is_empty(),
            "frame resolution must not be empty (got {})",
            self.resolution
        );
        match &self.source {
            SourceSpec::Stream(url) if url.trim().is_empty() => bail!("stream URL is empty"),
            SourceSpec::Synthetic { fps: 0, .. } => bail!("synthetic frame rate must be non-zero"),
            _ => {}
        }

        let min = self.detector.min_confidence;
        ensure!(
            (0.0..=1.0).contains(&min),
            "minimum confidence must be between 0 and 1 (got {min})"
        );
        ensure!(
            self.detector.num_classes > 0,
            "number of classes must be at least 1"
        );
        Ok(())
    }
}
