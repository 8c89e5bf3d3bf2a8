//! V4L2 webcam access.
//!
//! Only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are supported.

use std::path::PathBuf;

use anyhow::{bail, Context};
use image::ImageFormat;
use linuxvideo::{
    format::{PixFormat, Pixelformat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device,
};

use crate::{
    image::{Frame, Resolution},
    timer::Timer,
};

use super::FrameSource;

/// A webcam yielding a stream of `Rgb8` [`Frame`]s.
pub struct Webcam {
    stream: Option<ReadStream>,
    resolution: Resolution,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl Webcam {
    /// Opens `/dev/video{index}` and starts capturing at `resolution`.
    ///
    /// The device may pick a different resolution if it doesn't support the requested one; frames
    /// are delivered at whatever size it chose.
    ///
    /// This can block for a significant amount of time while the webcam initializes (on the order
    /// of hundreds of milliseconds).
    pub fn open(index: u32, resolution: Resolution) -> anyhow::Result<Self> {
        let path = PathBuf::from(format!("/dev/video{index}"));
        let device = Device::open(&path)
            .with_context(|| format!("failed to open capture device {}", path.display()))?;

        let caps = device.capabilities()?;
        let cap_flags = caps.device_capabilities();
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );
        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            bail!("{} is not a video capture device", path.display());
        }

        let pixel_format = jpeg_format(&device)?;
        let capture = device.video_capture(PixFormat::new(
            resolution.width(),
            resolution.height(),
            pixel_format,
        ))?;

        let format = capture.format();
        let actual = Resolution::new(format.width(), format.height());
        if actual != resolution {
            log::warn!("requested {resolution} from {}, got {actual}", caps.card());
        }
        log::info!("opened {} ({}), {actual}", caps.card(), path.display());

        Ok(Self {
            stream: Some(capture.into_stream(2)?),
            resolution: actual,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        })
    }

    /// Returns the resolution the device delivers frames in.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

fn jpeg_format(device: &Device) -> anyhow::Result<Pixelformat> {
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?.pixelformat();
        if format == Pixelformat::JPEG || format == Pixelformat::MJPG {
            return Ok(format);
        }
    }
    bail!("device does not support JPEG or MJPG capture")
}

impl FrameSource for Webcam {
    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        let Some(stream) = &mut self.stream else {
            return Ok(None);
        };

        let res = self.resolution;
        let t_decode = &self.t_decode;
        let dequeue_guard = self.t_dequeue.start();
        let frame = stream.dequeue(|buf| {
            drop(dequeue_guard);
            let decoded =
                t_decode.time(|| image::load_from_memory_with_format(&buf, ImageFormat::Jpeg));
            Ok(match decoded {
                Ok(image) => Frame::from_rgb_image(image.into_rgb8()),
                Err(e) => {
                    // Webcams occasionally deliver corrupted MJPG frames. Skipping them would cause
                    // latency spikes, so hand back a blank frame instead.
                    log::error!("webcam decode error: {e}");
                    Frame::blank(res)
                }
            })
        })?;
        Ok(Some(frame))
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("webcam stream closed");
        }
    }

    fn timers(&self) -> Vec<&Timer> {
        vec![&self.t_dequeue, &self.t_decode]
    }
}
