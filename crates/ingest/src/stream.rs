//! Capture primitives behind a source.
//!
//! A `CaptureStream` yields decoded frames until it runs dry and releases its
//! handle when dropped. A `StreamOpener` turns a `SourceKind` into a stream; it
//! is the only place device and file sources differ.

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::mjpeg::MjpegFileStream;
use crate::source::SourceKind;
use std::path::Path;

/// File targets with this prefix produce generated frames instead of reading a file.
pub const SYNTHETIC_SCHEME: &str = "stub://";

const SYNTHETIC_WIDTH: u32 = 64;
const SYNTHETIC_HEIGHT: u32 = 48;

pub trait CaptureStream {
    /// Next frame in capture order. `Ok(None)` marks the end of the stream.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Opens the capture stream of a source. Called on the worker thread.
pub trait StreamOpener: Send + Sync {
    fn open(&self, kind: &SourceKind) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

impl<F> StreamOpener for F
where
    F: Fn(&SourceKind) -> Result<Box<dyn CaptureStream>, CaptureError> + Send + Sync,
{
    fn open(&self, kind: &SourceKind) -> Result<Box<dyn CaptureStream>, CaptureError> {
        self(kind)
    }
}

/// Default opener: V4L2 cameras for devices, Motion-JPEG for files.
#[derive(Debug, Default, Clone, Copy)]
pub struct MediaOpener;

impl StreamOpener for MediaOpener {
    fn open(&self, kind: &SourceKind) -> Result<Box<dyn CaptureStream>, CaptureError> {
        match kind {
            SourceKind::Device(index) => open_device(*index),
            SourceKind::File(path) => open_file(path),
        }
    }
}

fn open_file(path: &Path) -> Result<Box<dyn CaptureStream>, CaptureError> {
    if let Some(count) = path.to_str().and_then(|p| p.strip_prefix(SYNTHETIC_SCHEME)) {
        let frames = count.parse::<u64>().map_err(|_| {
            CaptureError::open(
                path.display().to_string(),
                "synthetic targets take the form stub://<frame count>",
            )
        })?;
        return Ok(Box::new(SyntheticStream::new(frames)));
    }

    Ok(Box::new(MjpegFileStream::open(path)?))
}

#[cfg(feature = "v4l2")]
fn open_device(index: u32) -> Result<Box<dyn CaptureStream>, CaptureError> {
    Ok(Box::new(crate::device::DeviceStream::open(index)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_device(index: u32) -> Result<Box<dyn CaptureStream>, CaptureError> {
    Err(CaptureError::open(
        format!("/dev/video{}", index),
        "device capture requires the `v4l2` feature",
    ))
}

/// Generates a fixed number of gradient frames.
pub struct SyntheticStream {
    total: u64,
    produced: u64,
}

impl SyntheticStream {
    pub fn new(total: u64) -> Self {
        Self { total, produced: 0 }
    }
}

impl CaptureStream for SyntheticStream {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.produced >= self.total {
            return Ok(None);
        }

        let sequence = self.produced;
        self.produced += 1;

        let pixel_count = (SYNTHETIC_WIDTH * SYNTHETIC_HEIGHT * 3) as usize;
        let data = (0..pixel_count)
            .map(|i| ((i as u64 + sequence) % 256) as u8)
            .collect();

        Ok(Some(Frame::new(
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            sequence,
            data,
        )))
    }
}
