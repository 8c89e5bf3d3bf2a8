//! The main capture/render loop.

use anyhow::anyhow;

use crate::{
    detector::DetectionResult,
    image::Frame,
    pipeline::{Pipeline, Shutdown},
    pool::WorkerReport,
    render::{Renderer, Sink},
    source::FrameSource,
    timer::{FpsCounter, ThroughputTracker},
};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The quit signal was raised. Frames still queued were not processed.
    Interrupted,
    /// The frame source ran out of frames. Every captured frame was processed.
    SourceEnded,
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct RunReport {
    /// Frames read from the source and submitted to the pipeline.
    pub captured: u64,
    /// Results rendered and handed to the sink, including those drained at shutdown.
    pub rendered: u64,
    /// Capture throughput, covering the whole session.
    pub capture: ThroughputTracker,
    pub workers: Vec<WorkerReport>,
    pub end: EndReason,
}

/// Runs the capture loop until the source ends, `quit` returns `true`, or an error occurs.
///
/// Every iteration reads one frame, submits it to `pipeline` (blocking while the input queue is
/// full), then renders at most one finished result without waiting for it. `quit` is polled once
/// per iteration.
///
/// When the loop ends, the pipeline is shut down: drained if the source ended, stopped otherwise.
/// All results that are still queued afterwards are rendered too. Source and sink errors are
/// returned after this cleanup.
pub fn run<S, K, Q>(
    source: &mut S,
    mut pipeline: Pipeline,
    renderer: &Renderer,
    sink: &mut K,
    mut quit: Q,
) -> anyhow::Result<RunReport>
where
    S: FrameSource + ?Sized,
    K: Sink + ?Sized,
    Q: FnMut() -> bool,
{
    let mut capture = ThroughputTracker::new("capture");
    let mut fps = FpsCounter::new("capture");
    let mut latest: Option<Frame> = None;
    let mut rendered = 0;

    capture.start();
    let mut outcome = loop {
        let frame = match source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(EndReason::SourceEnded),
            Err(e) => break Err(e.context("failed to read frame")),
        };
        latest = Some(frame.clone());
        if let Err(e) = pipeline.submit(frame) {
            break Err(anyhow!(e));
        }

        if let Some(result) = pipeline.try_result() {
            if let Err(e) = render(renderer, latest.as_ref(), &result, sink) {
                break Err(e);
            }
            rendered += 1;
        }

        capture.update();
        fps.tick();

        if quit() {
            log::info!("stop requested");
            break Ok(EndReason::Interrupted);
        }
    };

    let Shutdown { pending, workers } = match &outcome {
        Ok(EndReason::SourceEnded) => pipeline.finish(),
        _ => {
            log::debug!("stopping workers with {} frames still queued", pipeline.queued());
            pipeline.stop()
        }
    };
    if !pending.is_empty() {
        log::debug!("rendering {} results left after shutdown", pending.len());
    }
    for result in pending {
        match render(renderer, latest.as_ref(), &result, sink) {
            Ok(()) => rendered += 1,
            Err(e) => {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
                break;
            }
        }
    }

    capture.stop();
    source.stop();
    log::info!("elapsed time (total): {:.2}", capture.elapsed_secs());
    log::info!("approx. FPS: {:.2}", capture.rate());

    let end = outcome?;
    Ok(RunReport {
        captured: capture.frames(),
        rendered,
        capture,
        workers,
        end,
    })
}

fn render<K: Sink + ?Sized>(
    renderer: &Renderer,
    latest: Option<&Frame>,
    result: &DetectionResult,
    sink: &mut K,
) -> anyhow::Result<()> {
    let Some(base) = latest.or(result.frame()) else {
        log::warn!("no frame to draw result {} on", result.seq());
        return Ok(());
    };
    let image = renderer.annotate(base, result);
    sink.consume(result.seq(), &image)
}
