//! Live camera capture through V4L2.

use crate::decoder::{FrameDecoder, MjpegDecoder, YuyvDecoder};
use crate::error::CaptureError;
use crate::frame::Frame;
use crate::stream::CaptureStream;
use v4l::{
    Device, FourCC,
    buffer::Type,
    io::{mmap::Stream, traits::CaptureStream as _},
    video::Capture,
};

const BUFFER_COUNT: u32 = 4;

const FOURCC_YUYV: FourCC = FourCC { repr: *b"YUYV" };
const FOURCC_MJPG: FourCC = FourCC { repr: *b"MJPG" };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
}

/// Select best pixel format: prefer YUYV (faster decode), fallback to MJPEG
fn select_format(device: &Device) -> Result<PixelFormat, String> {
    let formats = device.enum_formats().map_err(|e| e.to_string())?;

    tracing::debug!("Available formats:");
    for fmt in &formats {
        tracing::debug!("  {:?}: {}", fmt.fourcc, fmt.description);
    }

    if formats.iter().any(|f| f.fourcc == FOURCC_YUYV) {
        return Ok(PixelFormat::Yuyv);
    }

    if formats.iter().any(|f| f.fourcc == FOURCC_MJPG) {
        return Ok(PixelFormat::Mjpeg);
    }

    Err(format!(
        "camera supports neither YUYV nor MJPEG - available: {:?}",
        formats.iter().map(|f| f.fourcc).collect::<Vec<_>>()
    ))
}

/// An open `/dev/video<index>` capture stream.
///
/// Field order matters: the mmap stream is released before the device handle.
pub struct DeviceStream {
    stream: Stream<'static>,
    _device: Device,
    decoder: Box<dyn FrameDecoder>,
    width: u32,
    height: u32,
    sequence: u64,
}

impl DeviceStream {
    pub fn open(index: u32) -> Result<Self, CaptureError> {
        let target = format!("/dev/video{}", index);
        let fail = |reason: String| CaptureError::open(target.clone(), reason);

        let device = Device::new(index as usize).map_err(|e| fail(e.to_string()))?;
        let caps = device.query_caps().map_err(|e| fail(e.to_string()))?;
        tracing::info!("Camera opened: {} ({})", caps.card, caps.driver);

        let pixel_format = select_format(&device).map_err(fail)?;
        let fourcc = match pixel_format {
            PixelFormat::Yuyv => FOURCC_YUYV,
            PixelFormat::Mjpeg => FOURCC_MJPG,
        };

        let mut format = device.format().map_err(|e| fail(e.to_string()))?;
        format.fourcc = fourcc;
        let format = device
            .set_format(&format)
            .map_err(|e| fail(e.to_string()))?;

        tracing::info!(
            "Capture format: {}x{} {:?} ({:?})",
            format.width,
            format.height,
            format.fourcc,
            pixel_format
        );

        let decoder: Box<dyn FrameDecoder> = match pixel_format {
            PixelFormat::Yuyv => Box::new(YuyvDecoder),
            PixelFormat::Mjpeg => Box::new(MjpegDecoder),
        };

        let stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| fail(format!("failed to create capture stream: {}", e)))?;

        Ok(Self {
            stream,
            _device: device,
            decoder,
            width: format.width,
            height: format.height,
            sequence: 0,
        })
    }
}

impl CaptureStream for DeviceStream {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::Read(format!("capture error: {}", e)))?;

        let frame = self
            .decoder
            .decode(buf, self.width, self.height, self.sequence)?;
        self.sequence += 1;
        Ok(Some(frame))
    }
}
