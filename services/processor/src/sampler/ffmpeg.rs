//! External-process decoder: `ffprobe` for stream metadata, `ffmpeg` piping
//! raw RGB24 frames on stdout.

use super::{DecodeError, DecodedFrame, DecoderFactory, FrameSource};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subset of `ffprobe -print_format json -show_streams` we use.
#[derive(Debug, Clone, Deserialize)]
struct StreamReport {
    #[serde(default)]
    streams: Vec<ReportedStream>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReportedStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
    #[serde(default)]
    tags: StreamTags,
}

#[derive(Debug, Clone, Deserialize)]
struct SideData {
    rotation: Option<f64>,
}

/// Older ffprobe builds report rotation as a `rotate` tag.
#[derive(Debug, Clone, Default, Deserialize)]
struct StreamTags {
    rotate: Option<String>,
}

impl ReportedStream {
    /// Display rotation in degrees, normalized to `0..360`.
    fn rotation(&self) -> i64 {
        self.side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| self.tags.rotate.as_deref().and_then(|r| r.trim().parse().ok()))
            .map(|degrees: f64| (degrees.round() as i64).rem_euclid(360))
            .unwrap_or(0)
    }
}

/// Video stream geometry and rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

/// Parse an ffprobe rate such as `30000/1001` or `25`. `0/0` yields `None`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn stream_info(report: &StreamReport) -> Option<StreamInfo> {
    let video = report
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))?;
    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate));

    // ffmpeg applies the display rotation, so quarter turns swap the output geometry
    let (width, height) = match (video.width, video.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => return None,
    };
    let (width, height) = match video.rotation() {
        90 | 270 => (height, width),
        _ => (width, height),
    };
    Some(StreamInfo { width, height, fps })
}

/// Decoder backed by the ffmpeg command-line tools.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl FfmpegDecoder {
    /// Check both binaries run, once, at startup.
    pub async fn resolve(ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf) -> Result<Self, DecodeError> {
        for bin in [&ffmpeg_bin, &ffprobe_bin] {
            let output = Command::new(bin)
                .arg("-version")
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .await
                .map_err(|e| DecodeError::Unavailable(format!("{}: {}", bin.display(), e)))?;

            if !output.status.success() {
                return Err(DecodeError::Unavailable(format!(
                    "{} -version exited with {}",
                    bin.display(),
                    output.status
                )));
            }

            let banner = String::from_utf8_lossy(&output.stdout);
            info!(
                binary = %bin.display(),
                version = banner.lines().next().unwrap_or_default(),
                "Resolved decoder binary"
            );
        }

        Ok(Self {
            ffmpeg_bin,
            ffprobe_bin,
        })
    }

    async fn inspect(&self, path: &Path) -> Result<StreamInfo, DecodeError> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-print_format", "json", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::Open(format!(
                "ffprobe failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let report: StreamReport = serde_json::from_slice(&output.stdout)
            .map_err(|e| DecodeError::Open(format!("unreadable ffprobe output: {}", e)))?;

        stream_info(&report).ok_or_else(|| DecodeError::Open("no video stream".to_string()))
    }
}

#[async_trait]
impl DecoderFactory for FfmpegDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let info = self.inspect(path).await?;

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-autorotate"])
            .arg("-i")
            .arg(path)
            .args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError::Open(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecodeError::Open("ffmpeg stdout not captured".to_string()))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text).await;
                text
            })
        });

        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = ?info.fps,
            "Started ffmpeg decode"
        );

        Ok(Box::new(FfmpegSource {
            child,
            frames: RawFrameReader::new(stdout, info.width, info.height),
            stderr,
            fps: info.fps,
        }))
    }
}

/// Splits a packed RGB24 byte stream into frames.
struct RawFrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    frame_size: usize,
    position: u64,
}

impl<R: AsyncRead + Unpin + Send> RawFrameReader<R> {
    fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            frame_size: width as usize * height as usize * 3,
            position: 0,
        }
    }

    /// `Ok(None)` on a clean end of stream, `Truncated` on a partial frame.
    async fn read_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        let mut buf = BytesMut::zeroed(self.frame_size);
        let mut filled = 0;
        while filled < self.frame_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < self.frame_size {
            return Err(DecodeError::Truncated {
                position: self.position,
                expected: self.frame_size,
                actual: filled,
            });
        }

        let frame = DecodedFrame {
            position: self.position,
            width: self.width,
            height: self.height,
            data: buf.freeze(),
        };
        self.position += 1;
        Ok(Some(frame))
    }
}

struct FfmpegSource {
    child: Child,
    frames: RawFrameReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    fps: Option<f64>,
}

impl FfmpegSource {
    async fn stderr_text(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default().trim().to_string(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn reported_fps(&self) -> Option<f64> {
        self.fps
    }

    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        match self.frames.read_frame().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                let status = self.child.wait().await?;
                if status.success() {
                    return Ok(None);
                }
                let message = self.stderr_text().await;
                warn!(%status, stderr = %message, "ffmpeg exited with an error");
                Err(DecodeError::Stream {
                    position: self.frames.position,
                    message: if message.is_empty() {
                        format!("ffmpeg exited with {}", status)
                    } else {
                        message
                    },
                })
            }
            Err(e) => {
                let _ = self.child.start_kill();
                Err(e)
            }
        }
    }
}
