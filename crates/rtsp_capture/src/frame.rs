use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur while building or encoding a frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("buffer of {actual} bytes does not match {width}x{height} RGB24 ({expected} bytes)")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("row stride {stride} does not fit {width}x{height} RGB24 in {len} bytes")]
    InvalidStride {
        stride: i32,
        width: u32,
        height: u32,
        len: usize,
    },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A decoded video frame (RGB24, tightly packed)
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGB24 buffer. The buffer must hold exactly `width * height * 3` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// Copy an RGB24 image whose rows are `stride` bytes apart, dropping any
    /// row padding.
    pub fn from_strided(
        src: &[u8],
        width: u32,
        height: u32,
        stride: i32,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidStride {
            stride,
            width,
            height,
            len: src.len(),
        };

        let row_bytes = width as usize * 3;
        let rows = height as usize;
        let stride_bytes = usize::try_from(stride).map_err(|_| invalid())?;
        let needed = stride_bytes
            .checked_mul(rows.saturating_sub(1))
            .and_then(|n| n.checked_add(row_bytes))
            .ok_or_else(invalid)?;
        if rows == 0 || stride_bytes < row_bytes || src.len() < needed {
            return Err(invalid());
        }

        let data = if stride_bytes == row_bytes {
            src[..row_bytes * rows].to_vec()
        } else {
            let mut data = Vec::with_capacity(row_bytes * rows);
            for row in src.chunks(stride_bytes).take(rows) {
                data.extend_from_slice(&row[..row_bytes]);
            }
            data
        };

        Self::new(data, width, height, sequence)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes
    #[inline]
    pub fn step(&self) -> u32 {
        self.width * 3
    }

    /// Per-stream sequence number assigned by the decoder
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Encode the frame as a baseline JPEG at the given quality (1-100)
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &self.data,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}
