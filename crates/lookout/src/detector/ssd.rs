//! SSD object detection models exported from the TensorFlow object detection API.
//!
//! These models take a single `u8` RGB image of shape `[1, H, W, 3]` and produce four outputs:
//!
//! - `detection_boxes`: `[1, N, 4]`, normalized `(ymin, xmin, ymax, xmax)`
//! - `detection_scores`: `[1, N]`, sorted in descending order
//! - `detection_classes`: `[1, N]`, 1-based class ids (as floats)
//! - `num_detections`: `[1]`, how many of the `N` entries are valid

use std::{path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::{
    tvec, DatumType, Framework, Graph, InferenceFact, InferenceModelExt, SimplePlan, TValue,
    Tensor, TypedFact, TypedOp,
};

use crate::{
    config::DetectorConfig,
    image::{Frame, PixelLayout, Resolution},
    labels::{class_color, format_label, LabelMap},
    timer::Timer,
};

use super::{BoundingBox, Detections, Detector, Region};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// At most this many regions are reported per frame.
pub const MAX_DETECTIONS: usize = 20;

/// Indices of the model outputs we need, in the order the plan returns them.
#[derive(Debug, Clone, Copy)]
struct OutputSlots {
    boxes: usize,
    scores: usize,
    classes: usize,
    count: usize,
}

/// A [`Detector`] running an SSD model on the CPU with `tract`.
pub struct SsdDetector {
    model: Model,
    outputs: OutputSlots,
    input_res: Resolution,
    labels: Arc<LabelMap>,
    min_confidence: f32,
    t_resize: Timer,
    t_infer: Timer,
}

impl SsdDetector {
    /// Loads and optimizes the model at `config`'s model path, fixing its input size to
    /// `input_res`.
    pub fn load(
        config: &DetectorConfig,
        input_res: Resolution,
        labels: Arc<LabelMap>,
    ) -> anyhow::Result<Self> {
        let path = config.get_model_path();
        let model = Self::load_model(path, input_res)
            .with_context(|| format!("failed to load model '{}'", path.display()))?;
        let outputs = OutputSlots {
            boxes: find_output(&model, "boxes")?,
            scores: find_output(&model, "scores")?,
            classes: find_output(&model, "classes")?,
            count: find_output(&model, "num_detections")?,
        };
        log::debug!("loaded '{}' with input {input_res}", path.display());

        Ok(Self {
            model,
            outputs,
            input_res,
            labels,
            min_confidence: config.get_min_confidence(),
            t_resize: Timer::new("resize"),
            t_infer: Timer::new("infer"),
        })
    }

    fn load_model(path: &Path, res: Resolution) -> anyhow::Result<Model> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!("model file must have `.onnx` extension"),
        }

        let (w, h) = (res.width() as usize, res.height() as usize);
        let graph = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, InferenceFact::dt_shape(DatumType::U8, tvec!(1, h, w, 3)))?
            .into_optimized()?;
        Ok(SimplePlan::new(graph)?)
    }

    fn input_tensor(&self, frame: &Frame) -> anyhow::Result<Tensor> {
        let (w, h) = (self.input_res.width(), self.input_res.height());
        let data = if frame.resolution() == self.input_res {
            frame.to_layout(PixelLayout::Rgb8).data().to_vec()
        } else {
            let _guard = self.t_resize.start();
            imageops::resize(&frame.to_rgb_image(), w, h, FilterType::Triangle).into_raw()
        };
        Ok(Tensor::from_shape::<u8>(&[1, h as usize, w as usize, 3], &data)?)
    }
}

impl Detector for SsdDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Detections> {
        let input = self.input_tensor(frame)?;
        let outputs = {
            let _guard = self.t_infer.start();
            self.model.run(tvec!(TValue::from_const(Arc::new(input))))?
        };

        let read = |index: usize| -> anyhow::Result<Vec<f32>> {
            let tensor = outputs[index].cast_to::<f32>()?;
            Ok(tensor.as_slice::<f32>()?.to_vec())
        };
        let boxes = read(self.outputs.boxes)?;
        let scores = read(self.outputs.scores)?;
        let classes = read(self.outputs.classes)?;
        let count = read(self.outputs.count)?
            .first()
            .map_or(scores.len(), |&n| n.max(0.0) as usize);

        detections_from_ssd(
            &boxes,
            &scores,
            &classes,
            count,
            self.min_confidence,
            &self.labels,
        )
    }

    fn timers(&self) -> Vec<&Timer> {
        vec![&self.t_resize, &self.t_infer]
    }
}

fn find_output(model: &Model, key: &str) -> anyhow::Result<usize> {
    let graph = model.model();
    let outlets = graph.output_outlets()?;
    outlets
        .iter()
        .position(|&outlet| {
            graph.node(outlet.node).name.contains(key)
                || graph
                    .outlet_label(outlet)
                    .map_or(false, |label| label.contains(key))
        })
        .ok_or_else(|| {
            let names = outlets
                .iter()
                .map(|o| graph.node(o.node).name.as_str())
                .collect::<Vec<_>>();
            anyhow!("model has no output named like '{key}' (outputs: {names:?})")
        })
}

/// Converts raw SSD outputs into [`Detections`].
///
/// `boxes` holds 4 values per entry in `(ymin, xmin, ymax, xmax)` order, `scores` and `classes`
/// one value per entry. Only the first `count` entries are considered, and of those, entries
/// with a score above `min_confidence` are kept in model order (up to [`MAX_DETECTIONS`]).
pub fn detections_from_ssd(
    boxes: &[f32],
    scores: &[f32],
    classes: &[f32],
    count: usize,
    min_confidence: f32,
    labels: &LabelMap,
) -> anyhow::Result<Detections> {
    let count = count.min(scores.len());
    if boxes.len() < count * 4 || classes.len() < count {
        bail!(
            "inconsistent model outputs: {} boxes, {} scores, {} classes for {count} detections",
            boxes.len() / 4,
            scores.len(),
            classes.len(),
        );
    }

    let detections = (0..count)
        .filter(|&i| scores[i] > min_confidence)
        .take(MAX_DETECTIONS)
        .map(|i| {
            let [ymin, xmin, ymax, xmax] = [
                boxes[i * 4],
                boxes[i * 4 + 1],
                boxes[i * 4 + 2],
                boxes[i * 4 + 3],
            ];
            let class = classes[i].max(0.0) as u32;
            Region::new(
                BoundingBox::new(xmin, ymin, xmax, ymax),
                format_label(labels.name_or_unknown(class), scores[i]),
                scores[i],
                class_color(class),
            )
        })
        .collect();
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelMap {
        LabelMap::from_names([(1, "person"), (18, "dog")])
    }

    #[test]
    fn keeps_confident_entries_in_model_order() {
        let boxes = [
            0.2, 0.1, 0.8, 0.5, //
            0.0, 0.0, 1.0, 1.0, //
            0.5, 0.5, 0.6, 0.6, //
        ];
        let scores = [0.9, 0.3, 0.51];
        let classes = [1.0, 18.0, 18.0];

        let dets = detections_from_ssd(&boxes, &scores, &classes, 3, 0.5, &labels()).unwrap();
        let regions = dets.iter().collect::<Vec<_>>();
        assert_eq!(regions.len(), 2);

        assert_eq!(regions[0].label(), "person: 90%");
        assert_eq!(regions[0].confidence(), 0.9);
        assert_eq!(*regions[0].bbox(), BoundingBox::new(0.1, 0.2, 0.5, 0.8));
        assert_eq!(regions[0].color(), class_color(1));

        assert_eq!(regions[1].label(), "dog: 51%");
        assert_eq!(regions[1].color(), class_color(18));
    }

    #[test]
    fn threshold_is_exclusive() {
        let dets =
            detections_from_ssd(&[0.0; 4], &[0.5], &[1.0], 1, 0.5, &labels()).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn unknown_class_is_labeled_na() {
        let dets = detections_from_ssd(&[0.0; 4], &[0.75], &[42.0], 1, 0.5, &labels()).unwrap();
        assert_eq!(dets.iter().next().unwrap().label(), "N/A: 75%");
    }

    #[test]
    fn only_first_count_entries_are_used() {
        let dets = detections_from_ssd(
            &[0.0; 12],
            &[0.9, 0.9, 0.9],
            &[1.0, 1.0, 1.0],
            1,
            0.5,
            &labels(),
        )
        .unwrap();
        assert_eq!(dets.len(), 1);
    }

    #[test]
    fn caps_number_of_regions() {
        let n = MAX_DETECTIONS + 5;
        let dets = detections_from_ssd(
            &vec![0.0; n * 4],
            &vec![0.99; n],
            &vec![1.0; n],
            n,
            0.5,
            &labels(),
        )
        .unwrap();
        assert_eq!(dets.len(), MAX_DETECTIONS);
    }

    #[test]
    fn rejects_truncated_outputs() {
        let result = detections_from_ssd(&[0.0; 4], &[0.9, 0.9], &[1.0, 1.0], 2, 0.5, &labels());
        assert!(result.is_err());
    }
}
