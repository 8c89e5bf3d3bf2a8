//! Live object detection on a webcam or MJPEG stream.
//!
//! Press Ctrl-C, or type `q` and Enter, to stop.

use std::{
    io::{self, BufRead},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use lookout::{
    config::{DetectorConfig, FailurePolicy, OverlayTarget, PipelineConfig, SourceSpec},
    detector::ssd::SsdDetector,
    image::Resolution,
    labels::LabelMap,
    pipeline::Pipeline,
    render::{DirectorySink, LogSink, Renderer, Sink},
    session, source,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Overlay {
    /// Draw results onto the most recently captured frame.
    Latest,
    /// Draw results onto the frame they were computed from.
    Source,
}

/// Multi-threaded live object detection.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of an MJPEG stream to read instead of a local camera.
    #[arg(short = 's', long, conflicts_with = "source")]
    stream_input: Option<String>,

    /// Index of the capture device to read (`/dev/video<N>`).
    #[arg(short = 'd', long, default_value_t = 0)]
    source: u32,

    /// Width of the frames.
    #[arg(short = 'w', long, default_value_t = 640)]
    width: u32,

    /// Height of the frames.
    #[arg(short = 'H', long, default_value_t = 480)]
    height: u32,

    /// Number of detection workers.
    #[arg(short = 'n', long, default_value_t = 2)]
    num_workers: usize,

    /// Number of frames that may wait for a free worker.
    #[arg(short = 'q', long, default_value_t = 2)]
    queue_size: usize,

    /// ONNX detection model.
    #[arg(long, default_value = "model/frozen_inference_graph.onnx")]
    model: PathBuf,

    /// Label map of the model's classes.
    #[arg(long, default_value = "model/mscoco_label_map.pbtxt")]
    labels: PathBuf,

    /// Number of classes the model distinguishes.
    #[arg(long, default_value_t = 90)]
    num_classes: u32,

    /// Minimum score for a detection to be shown.
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,

    /// Which frame detection results are drawn onto.
    #[arg(long, value_enum, default_value_t = Overlay::Latest)]
    overlay: Overlay,

    /// Run detection a second time when it fails on a frame (default).
    #[arg(long, overrides_with = "no_retry")]
    retry: bool,

    /// Skip frames as soon as detection fails on them.
    #[arg(long, overrides_with = "retry")]
    no_retry: bool,

    /// Directory to save annotated frames to. Without it, frames are only logged.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Process this many generated frames instead of reading a camera.
    #[arg(long, conflicts_with = "stream_input")]
    synthetic: Option<u64>,

    /// Frame rate of generated frames.
    #[arg(long, default_value_t = 30)]
    fps: u32,
}

impl Args {
    fn to_config(&self) -> PipelineConfig {
        let source = match (&self.synthetic, &self.stream_input) {
            (Some(frames), _) => SourceSpec::Synthetic {
                frames: *frames,
                fps: self.fps,
            },
            (None, Some(url)) => SourceSpec::Stream(url.clone()),
            (None, None) => SourceSpec::Device(self.source),
        };
        let detector = DetectorConfig::default()
            .model_path(&self.model)
            .labels_path(&self.labels)
            .num_classes(self.num_classes)
            .min_confidence(self.min_confidence);

        PipelineConfig::default()
            .source(source)
            .resolution(Resolution::new(self.width, self.height))
            .pool_size(self.num_workers)
            .queue_capacity(self.queue_size)
            .overlay(match self.overlay {
                Overlay::Latest => OverlayTarget::LatestCapture,
                Overlay::Source => OverlayTarget::SourceFrame,
            })
            .failure_policy(if self.no_retry && !self.retry {
                FailurePolicy::Skip
            } else {
                FailurePolicy::RetryOnce
            })
            .detector(detector)
    }
}

/// Sets `quit` on Ctrl-C or when `q` is entered on stdin.
fn install_quit_handlers(quit: &Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler({
        let quit = quit.clone();
        move || quit.store(true, Ordering::SeqCst)
    })
    .context("failed to install Ctrl-C handler")?;

    let quit = quit.clone();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        quit.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("stdin closed: {e}");
                        break;
                    }
                }
            }
        })
        .context("failed to spawn stdin thread")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    lookout::init_logger!();

    let args = Args::parse();
    let config = args.to_config();
    config.validate()?;
    log::debug!("{config:?}");

    let detector_config = config.get_detector().clone();
    let labels = Arc::new(LabelMap::load(
        detector_config.get_labels_path(),
        detector_config.get_num_classes(),
    )?);
    log::info!("loaded {} class labels", labels.len());

    let res = config.get_resolution();
    let pipeline = Pipeline::start(&config, move |index| {
        log::debug!("loading detector for worker {index}");
        SsdDetector::load(&detector_config, res, labels.clone())
    })?;

    let mut source = source::open(&config)?;
    let mut sink: Box<dyn Sink> = match &args.output_dir {
        Some(dir) => {
            let sink = DirectorySink::new(dir)?;
            log::info!("saving annotated frames to {}", sink.dir().display());
            Box::new(sink)
        }
        None => Box::new(LogSink::new()),
    };

    let quit = Arc::new(AtomicBool::new(false));
    install_quit_handlers(&quit)?;

    let report = session::run(
        &mut source,
        pipeline,
        &Renderer::new(&config),
        &mut sink,
        || quit.load(Ordering::SeqCst),
    )?;

    log::info!(
        "{:?}: captured {} frames, rendered {} results",
        report.end,
        report.captured,
        report.rendered,
    );
    for worker in &report.workers {
        log::info!("{worker}");
    }

    Ok(())
}
