//! Motion-JPEG file stream.
//!
//! An `.mjpeg` file is a plain concatenation of JPEG images. Each frame is
//! delimited by walking its marker segments from SOI (`FF D8`) to EOI
//! (`FF D9`), so only one compressed frame is held in memory at a time.

use crate::decoder::{FrameDecoder, MjpegDecoder};
use crate::error::CaptureError;
use crate::frame::Frame;
use crate::stream::CaptureStream;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;
const RST: std::ops::RangeInclusive<u8> = 0xD0..=0xD7;

pub struct MjpegFileStream {
    path: PathBuf,
    reader: BufReader<File>,
    decoder: MjpegDecoder,
    sequence: u64,
}

impl MjpegFileStream {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path).map_err(|e| CaptureError::open(path.display().to_string(), e))?;
        tracing::debug!(path = %path.display(), "Opened Motion-JPEG file");

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            decoder: MjpegDecoder,
            sequence: 0,
        })
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Next complete JPEG image, `None` at end of file.
    fn next_image(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        let mut prev = None;
        loop {
            let Some(byte) = self.read_byte()? else {
                return Ok(None);
            };
            if prev == Some(MARKER) && byte == SOI {
                break;
            }
            prev = Some(byte);
        }

        let mut image = vec![MARKER, SOI];
        if self.read_segments(&mut image)?.is_none() {
            tracing::debug!(
                path = %self.path.display(),
                bytes = image.len(),
                "Discarding truncated trailing frame"
            );
            return Ok(None);
        }
        Ok(Some(image))
    }

    /// Copy marker segments into `image` up to and including EOI.
    ///
    /// Segment payloads are skipped by their declared length, so marker bytes
    /// inside APPn/COM data (EXIF thumbnails, ICC profiles) do not end the
    /// image. `None` when the file ends first.
    fn read_segments(&mut self, image: &mut Vec<u8>) -> Result<Option<()>, CaptureError> {
        let Some(mut marker) = self.next_marker(image)? else {
            return Ok(None);
        };
        loop {
            if marker == EOI {
                return Ok(Some(()));
            }
            if marker != TEM && !RST.contains(&marker) {
                if self.copy_segment(image)?.is_none() {
                    return Ok(None);
                }
                if marker == SOS {
                    match self.copy_scan(image)? {
                        Some(next) => {
                            marker = next;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
            }
            marker = match self.next_marker(image)? {
                Some(next) => next,
                None => return Ok(None),
            };
        }
    }

    fn next_marker(&mut self, image: &mut Vec<u8>) -> Result<Option<u8>, CaptureError> {
        let Some(byte) = self.read_byte()? else {
            return Ok(None);
        };
        if byte != MARKER {
            return Err(CaptureError::Read(format!(
                "expected JPEG marker at byte {}, found {:#04x}",
                image.len(),
                byte
            )));
        }

        // 0xFF fill bytes may precede any marker
        loop {
            match self.read_byte()? {
                None => return Ok(None),
                Some(MARKER) => continue,
                Some(marker) => {
                    image.extend([MARKER, marker]);
                    return Ok(Some(marker));
                }
            }
        }
    }

    /// Copy a length-prefixed segment body.
    fn copy_segment(&mut self, image: &mut Vec<u8>) -> Result<Option<()>, CaptureError> {
        let mut prefix = [0u8; 2];
        for byte in prefix.iter_mut() {
            match self.read_byte()? {
                Some(b) => *byte = b,
                None => return Ok(None),
            }
        }
        let length = u16::from_be_bytes(prefix) as usize;
        if length < 2 {
            return Err(CaptureError::Read(format!(
                "invalid JPEG segment length {}",
                length
            )));
        }
        image.extend(prefix);

        let body = length - 2;
        let copied = (&mut self.reader).take(body as u64).read_to_end(image)?;
        Ok((copied == body).then_some(()))
    }

    /// Copy entropy-coded data after SOS. Returns the marker that ends it.
    fn copy_scan(&mut self, image: &mut Vec<u8>) -> Result<Option<u8>, CaptureError> {
        loop {
            let Some(byte) = self.read_byte()? else {
                return Ok(None);
            };
            if byte != MARKER {
                image.push(byte);
                continue;
            }

            let mut next = self.read_byte()?;
            while next == Some(MARKER) {
                next = self.read_byte()?;
            }
            let Some(next) = next else {
                return Ok(None);
            };
            image.extend([MARKER, next]);
            if next != 0x00 && !RST.contains(&next) {
                return Ok(Some(next));
            }
        }
    }
}

impl CaptureStream for MjpegFileStream {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(image) = self.next_image()? else {
            return Ok(None);
        };

        let frame = self.decoder.decode(&image, 0, 0, self.sequence)?;
        self.sequence += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};
    use std::io::Write;

    fn jpeg(shade: u8) -> Vec<u8> {
        let pixels = vec![shade; 16 * 8 * 3];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .write_image(&pixels, 16, 8, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn test_reads_every_frame_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for shade in [10u8, 120, 240] {
            file.write_all(&jpeg(shade)).unwrap();
        }
        file.flush().unwrap();

        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        let mut sequences = Vec::new();
        while let Some(frame) = stream.read().unwrap() {
            assert_eq!((frame.width(), frame.height()), (16, 8));
            sequences.push(frame.sequence());
        }

        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_marker_bytes_inside_app_segment_do_not_split_frame() {
        // APP1 whose payload holds an EOI marker, as EXIF thumbnails do
        let plain = jpeg(90);
        let mut tagged = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x06, 0xFF, 0xD9, 0x00, 0x00];
        tagged.extend_from_slice(&plain[2..]);
        assert!(image::load_from_memory(&tagged).is_ok());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&tagged).unwrap();
        file.write_all(&jpeg(30)).unwrap();
        file.flush().unwrap();

        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        let first = stream.read().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (16, 8));
        assert_eq!(stream.read().unwrap().unwrap().sequence(), 1);
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_padding_between_frames_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&jpeg(10)).unwrap();
        file.write_all(&[0x00, 0x17, 0xFF]).unwrap();
        file.write_all(&jpeg(20)).unwrap();
        file.flush().unwrap();

        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        assert!(stream.read().unwrap().is_some());
        assert!(stream.read().unwrap().is_some());
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_truncated_trailing_frame_ends_stream() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&jpeg(50)).unwrap();
        let second = jpeg(60);
        file.write_all(&second[..second.len() / 2]).unwrap();
        file.flush().unwrap();

        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        assert!(stream.read().unwrap().is_some());
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_empty_file_has_no_frames() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_frame_is_read_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]).unwrap();
        file.flush().unwrap();

        let mut stream = MjpegFileStream::open(file.path()).unwrap();
        assert!(matches!(stream.read(), Err(CaptureError::Read(_))));
    }
}
