//! Frame sampling.
//!
//! A decoder backend produces raw RGB frames in decode order through
//! [`FrameSource`]; [`FrameSampler`] keeps every `interval`-th one, renumbers
//! them densely and encodes them as JPEG. Decoding is a single forward pass:
//! a sampler cannot be rewound, and re-sampling needs a fresh decoder.

pub mod ffmpeg;
#[cfg(feature = "gstreamer")]
pub mod gst;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that can occur while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open video: {0}")]
    Open(String),

    #[error("Decode failed after {position} frames: {message}")]
    Stream { position: u64, message: String },

    #[error("Truncated frame at position {position}: expected {expected} bytes, got {actual}")]
    Truncated {
        position: u64,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encoding failed: {0}")]
    Encode(String),

    #[error("Decoder I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame, tightly packed RGB24.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Zero-based position in decode order
    pub position: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// A forward-only stream of decoded frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Frame rate reported by the container, if any.
    fn reported_fps(&self) -> Option<f64>;

    /// Next frame in decode order, `None` at end of stream.
    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError>;
}

/// Opens local video files. One factory is resolved at startup and shared by jobs.
#[async_trait]
pub trait DecoderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError>;
}

/// `max(1, floor(source_fps / sample_rate))`, using `fallback_fps` when the
/// source does not report a usable rate.
pub fn sampling_interval(source_fps: Option<f64>, sample_rate: f64, fallback_fps: f64) -> u64 {
    let fps = source_fps
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(fallback_fps);
    let interval = (fps / sample_rate).floor();
    if interval.is_finite() && interval >= 1.0 {
        interval as u64
    } else {
        1
    }
}

/// A sampled frame ready for upload.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Dense zero-based output index
    pub index: u64,
    /// Decode position in the source
    pub source_offset: u64,
    pub jpeg: Bytes,
}

/// Lazily pulls frames from a [`FrameSource`] and keeps one every `interval`.
pub struct FrameSampler {
    source: Box<dyn FrameSource>,
    interval: u64,
    jpeg_quality: u8,
    next_index: u64,
    finished: bool,
}

impl FrameSampler {
    pub fn new(
        source: Box<dyn FrameSource>,
        sample_rate: f64,
        fallback_fps: f64,
        jpeg_quality: u8,
    ) -> Self {
        let reported = source.reported_fps();
        let interval = sampling_interval(reported, sample_rate, fallback_fps);

        debug!(
            reported_fps = ?reported,
            fallback_fps,
            sample_rate,
            interval,
            "Frame sampler ready"
        );

        Self {
            source,
            interval,
            jpeg_quality,
            next_index: 0,
            finished: false,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }

    /// Next sampled frame, `None` once the source is exhausted.
    ///
    /// After an error the sampler is finished; frames already returned stay valid.
    pub async fn next(&mut self) -> Result<Option<SampledFrame>, DecodeError> {
        while !self.finished {
            let frame = match self.source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            if frame.position % self.interval != 0 {
                continue;
            }

            let source_offset = frame.position;
            let quality = self.jpeg_quality;
            let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
                .await
                .map_err(|e| DecodeError::Encode(e.to_string()))
                .and_then(|r| r);
            let jpeg = match jpeg {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            let index = self.next_index;
            self.next_index += 1;
            trace!(index, source_offset, bytes = jpeg.len(), "Sampled frame");

            return Ok(Some(SampledFrame {
                index,
                source_offset,
                jpeg,
            }));
        }
        Ok(None)
    }
}

/// Encode an RGB24 frame as JPEG.
pub fn encode_jpeg(frame: &DecodedFrame, quality: u8) -> Result<Bytes, DecodeError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(DecodeError::Truncated {
            position: frame.position,
            expected,
            actual: frame.data.len(),
        });
    }

    let mut buf = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| DecodeError::Encode(e.to_string()))?;

    Ok(Bytes::from(buf))
}
