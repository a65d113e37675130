use crate::error::CaptureError;
use crate::frame::Frame;
use common::span_debug;
use image::ImageFormat;

/// Trait for decoding raw capture buffers to RGB frames.
pub trait FrameDecoder: Send {
    /// Decode one raw buffer into an RGB8 frame (3 bytes per pixel).
    ///
    /// `width` and `height` describe the raw buffer for formats that do not
    /// carry their own dimensions.
    fn decode(
        &mut self,
        raw: &[u8],
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Frame, CaptureError>;
}

/// YUYV (YUV 4:2:2) decoder.
///
/// YUYV packs 2 pixels in 4 bytes: [Y0, U, Y1, V]
#[derive(Default)]
pub struct YuyvDecoder;

impl FrameDecoder for YuyvDecoder {
    fn decode(
        &mut self,
        raw: &[u8],
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Frame, CaptureError> {
        let _s = span_debug!("decode_yuyv");

        let bytes_per_row = (width * 2) as usize;
        if height == 0 || raw.len() < bytes_per_row * height as usize {
            return Err(CaptureError::Read(format!(
                "YUYV buffer of {} bytes is too small for {}x{}",
                raw.len(),
                width,
                height
            )));
        }

        let stride = raw.len() / height as usize;
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);

        for row in 0..height as usize {
            let row_start = row * stride;
            let row_data = &raw[row_start..row_start + bytes_per_row];

            for chunk in row_data.chunks_exact(4) {
                let y0 = chunk[0] as i32;
                let u = chunk[1] as i32 - 128;
                let y1 = chunk[2] as i32;
                let v = chunk[3] as i32 - 128;

                // BT.601 fixed-point coefficients (8-bit fraction)
                // R = Y + 1.402*V  -> Y + (359*V >> 8)
                // G = Y - 0.344*U - 0.714*V -> Y - ((88*U + 183*V) >> 8)
                // B = Y + 1.772*U -> Y + (454*U >> 8)
                let rv = (359 * v) >> 8;
                let gu = (88 * u + 183 * v) >> 8;
                let bu = (454 * u) >> 8;

                for y in [y0, y1] {
                    rgb.push((y + rv).clamp(0, 255) as u8);
                    rgb.push((y - gu).clamp(0, 255) as u8);
                    rgb.push((y + bu).clamp(0, 255) as u8);
                }
            }
        }

        Ok(Frame::new(width, height, sequence, rgb))
    }
}

/// JPEG decoder for MJPEG cameras and Motion-JPEG files.
///
/// JPEG carries its own dimensions, so the `width`/`height` hints are ignored.
#[derive(Default)]
pub struct MjpegDecoder;

impl FrameDecoder for MjpegDecoder {
    fn decode(
        &mut self,
        raw: &[u8],
        _width: u32,
        _height: u32,
        sequence: u64,
    ) -> Result<Frame, CaptureError> {
        let _s = span_debug!("decode_jpeg");

        let image = image::load_from_memory_with_format(raw, ImageFormat::Jpeg)
            .map_err(|e| CaptureError::Read(format!("JPEG decode failed: {}", e)))?
            .into_rgb8();

        let (width, height) = image.dimensions();
        Ok(Frame::new(width, height, sequence, image.into_raw()))
    }
}
