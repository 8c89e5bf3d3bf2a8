//! IP webcam client for servers offering HTTP MJPG streams.
//!
//! The server must respond with `Content-Type: multipart/x-mixed-replace; boundary=...`, and
//! every part must be an `image/jpeg` with a `Content-Length` header.

use std::io::{BufRead, BufReader, Read};

use anyhow::{bail, Context};
use image::ImageFormat;

use crate::{image::Frame, timer::Timer};

use super::FrameSource;

/// A stream of JPEG images received over HTTP.
pub struct HttpStream {
    parts: MultipartReader<BufReader<Box<dyn Read + Send + Sync>>>,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl HttpStream {
    /// Sends a GET request to `url` and starts reading the multipart response.
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let response = ureq::get(url)
            .call()
            .with_context(|| format!("failed to connect to '{url}'"))?;
        log::trace!("response: {} {}", response.status(), response.status_text());

        let Some(content_type) = response.header("Content-Type") else {
            bail!("missing `Content-Type` header");
        };
        let boundary = parse_boundary(content_type)?;
        log::trace!("multipart boundary: {boundary}");
        log::info!("connected to {url}");

        let reader = BufReader::new(response.into_reader());
        Ok(Self {
            parts: MultipartReader::new(reader, boundary)?,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        })
    }
}

impl FrameSource for HttpStream {
    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        let Some(jpeg) = self.t_dequeue.time(|| self.parts.next_part())? else {
            log::debug!("stream ended");
            return Ok(None);
        };
        let image = self
            .t_decode
            .time(|| image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg))?;
        Ok(Some(Frame::from_rgb_image(image.into_rgb8())))
    }

    fn timers(&self) -> Vec<&Timer> {
        vec![&self.t_dequeue, &self.t_decode]
    }
}

/// Extracts the part delimiter from a `multipart/x-mixed-replace` content type.
///
/// The returned delimiter always starts with `--`.
pub fn parse_boundary(content_type: &str) -> anyhow::Result<String> {
    let Some((mime, params)) = content_type.split_once(';') else {
        bail!("malformed Content-Type header: {content_type}");
    };
    let mime = mime.trim();
    if !mime.eq_ignore_ascii_case("multipart/x-mixed-replace") {
        bail!("malformed Content-Type header: unexpected mime type {mime}");
    }

    let boundary = params
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'));
    let Some(boundary) = boundary.filter(|b| !b.is_empty()) else {
        bail!("malformed Content-Type header (missing boundary)");
    };

    // Some servers (Droidcam) include the `--` in the boundary parameter.
    Ok(if boundary.starts_with("--") {
        boundary.to_string()
    } else {
        format!("--{boundary}")
    })
}

/// Reads the bodies of consecutive parts out of a multipart stream.
pub struct MultipartReader<R> {
    reader: R,
    boundary: String,
}

impl<R: BufRead> MultipartReader<R> {
    /// Creates a reader and skips everything up to the first delimiter.
    ///
    /// `boundary` is the full delimiter line, including the leading `--`.
    pub fn new(reader: R, boundary: String) -> anyhow::Result<Self> {
        let mut this = Self { reader, boundary };
        if !this.skip_to_boundary()? {
            bail!("stream ended before the first part");
        }
        Ok(this)
    }

    /// Returns the body of the next part, or `None` if the stream has ended.
    pub fn next_part(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut length = None;
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
            if line.trim() == format!("{}--", self.boundary) {
                // Closing delimiter.
                return Ok(None);
            }
            log::trace!("multipart header: {}", line.trim());
            let Some((key, value)) = line.split_once(':') else {
                bail!("malformed multipart header: {}", line.trim());
            };
            if key.eq_ignore_ascii_case("Content-Type") && value.trim() != "image/jpeg" {
                bail!(
                    "unexpected Content-Type: expected image/jpeg, got {}",
                    value.trim()
                );
            }
            if key.eq_ignore_ascii_case("Content-Length") {
                length = Some(
                    value
                        .trim()
                        .parse::<u32>()
                        .context("invalid Content-Length")?,
                );
            }
        }

        let Some(length) = length else {
            bail!("missing Content-Length header");
        };
        let mut buf = vec![0; length as usize];
        self.reader
            .read_exact(&mut buf)
            .context("stream ended inside a part")?;
        self.skip_to_boundary()?;
        Ok(Some(buf))
    }

    /// Returns `false` if the stream ended before a delimiter was found.
    fn skip_to_boundary(&mut self) -> anyhow::Result<bool> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(false);
            }
            if line.trim() == self.boundary {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = b"preamble\r\n--frame\r\n".to_vec();
        for part in parts {
            out.extend_from_slice(
                format!(
                    "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    part.len()
                )
                .as_bytes(),
            );
            out.extend_from_slice(part);
            out.extend_from_slice(b"\r\n--frame\r\n");
        }
        out
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=frame").unwrap(),
            "--frame"
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace;boundary=\"--droid\"").unwrap(),
            "--droid"
        );
        assert!(parse_boundary("image/jpeg").is_err());
        assert!(parse_boundary("text/html; charset=utf-8").is_err());
        assert!(parse_boundary("multipart/x-mixed-replace; charset=utf-8").is_err());
    }

    #[test]
    fn reads_parts_until_end() {
        let data = stream(&[&b"\xff\xd8first"[..], &b"second\r\nwith newline"[..]]);
        let mut reader = MultipartReader::new(Cursor::new(data), "--frame".into()).unwrap();
        assert_eq!(reader.next_part().unwrap().unwrap(), b"\xff\xd8first");
        assert_eq!(
            reader.next_part().unwrap().unwrap(),
            b"second\r\nwith newline"
        );
        assert_eq!(reader.next_part().unwrap(), None);
    }

    #[test]
    fn rejects_bad_parts() {
        let data = b"--frame\r\nContent-Type: text/plain\r\nContent-Length: 1\r\n\r\nx\r\n--frame\r\n";
        let mut reader = MultipartReader::new(Cursor::new(&data[..]), "--frame".into()).unwrap();
        assert!(reader.next_part().is_err());

        let data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\nx\r\n--frame\r\n";
        let mut reader = MultipartReader::new(Cursor::new(&data[..]), "--frame".into()).unwrap();
        assert!(reader.next_part().is_err());

        assert!(MultipartReader::new(Cursor::new(&b"no delimiter"[..]), "--frame".into()).is_err());
    }

    #[test]
    fn decodes_jpeg_parts() {
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut jpeg)
            .encode(&[200; 8 * 8 * 3], 8, 8, image::ColorType::Rgb8)
            .unwrap();

        let data = stream(&[jpeg.as_slice()]);
        let mut reader = MultipartReader::new(Cursor::new(data), "--frame".into()).unwrap();
        let part = reader.next_part().unwrap().unwrap();
        let image = image::load_from_memory_with_format(&part, ImageFormat::Jpeg).unwrap();
        let frame = Frame::from_rgb_image(image.into_rgb8());
        assert_eq!((frame.width(), frame.height()), (8, 8));
    }
}
