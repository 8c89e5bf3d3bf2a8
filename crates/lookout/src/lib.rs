//! Live object detection on a pool of worker threads.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ─▶ input queue (bounded) ─▶ worker 0..N (one Detector each) ─▶ result queue ─▶ Renderer ─▶ Sink
//! ```
//!
//! The capture loop ([`session::run`]) reads frames and pushes them into a small bounded queue.
//! When all workers are busy and the queue is full, the capture loop blocks: this is the only
//! backpressure in the system. Each worker owns its own [`Detector`] for its entire lifetime, since
//! detectors are expensive to construct and not assumed to be thread-safe.
//!
//! Results flow back through an unbounded queue that the capture loop polls without blocking, so
//! it stays responsive to new frames and to the stop signal. With more than one worker, results
//! can arrive in a different order than their frames were captured. Every result carries the
//! sequence number of its frame so consumers can tell.
//!
//! # Environment Variables
//!
//! * `RUST_LOG`: overrides the log filter installed by [`init_logger!`].
//!
//! [`Detector`]: detector::Detector

pub mod config;
pub mod detector;
pub mod labels;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod render;
pub mod session;
pub mod source;
pub mod timer;

mod drop;

pub use lookout_image as image;

use log::LevelFilter;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and lookout will log at *trace* level.
/// Otherwise, they will log at *debug* level.
///
/// `tract` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
