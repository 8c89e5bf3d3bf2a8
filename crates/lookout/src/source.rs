//! Frame sources.
//!
//! A [`FrameSource`] yields frames until it runs dry. [`open`] picks the implementation selected
//! by a [`PipelineConfig`].

pub mod httpcam;
pub mod synthetic;
pub mod threaded;
pub mod webcam;

use crate::{
    config::{PipelineConfig, SourceSpec},
    image::Frame,
    timer::Timer,
};

use self::{
    httpcam::HttpStream, synthetic::SyntheticSource, threaded::ThreadedSource, webcam::Webcam,
};

/// A source of video frames.
pub trait FrameSource {
    /// Returns the next frame, blocking until it is available.
    ///
    /// Returns `Ok(None)` once the source has cleanly reached its end. Errors are terminal: the
    /// caller should not read from the source again.
    fn read(&mut self) -> anyhow::Result<Option<Frame>>;

    /// Releases the underlying device or connection.
    ///
    /// Subsequent calls to [`FrameSource::read`] return `Ok(None)` or an error.
    fn stop(&mut self) {}

    /// Timers measuring device access and decoding, logged periodically by the reader.
    fn timers(&self) -> Vec<&Timer> {
        Vec::new()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        (**self).read()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn timers(&self) -> Vec<&Timer> {
        (**self).timers()
    }
}

/// Opens the frame source selected by `config`.
///
/// Devices and network streams are read on a background thread (see [`ThreadedSource`]), so
/// capture latency overlaps with the rest of the loop.
pub fn open(config: &PipelineConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    let res = config.get_resolution();
    Ok(match config.get_source() {
        SourceSpec::Device(index) => {
            let index = *index;
            Box::new(ThreadedSource::spawn("webcam", move || {
                Webcam::open(index, res)
            })?)
        }
        SourceSpec::Stream(url) => {
            let url = url.clone();
            Box::new(ThreadedSource::spawn("httpcam", move || {
                HttpStream::connect(&url)
            })?)
        }
        SourceSpec::Synthetic { frames, fps } => {
            Box::new(SyntheticSource::new(res, *frames).fps(*fps))
        }
    })
}
