//! In-process decoder built on a GStreamer `decodebin ! appsink` pipeline.
//!
//! The pipeline runs on its own OS thread and hands frames to the async side
//! over a bounded channel, so decoding stays one frame ahead of the sampler.

use super::{DecodeError, DecodedFrame, DecoderFactory, FrameSource};
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const REQUIRED_ELEMENTS: [&str; 4] = ["filesrc", "decodebin", "videoconvert", "appsink"];

/// Decoder backed by GStreamer.
#[derive(Debug, Clone)]
pub struct GstDecoder;

impl GstDecoder {
    /// Initialize GStreamer and check the elements the pipeline needs.
    pub fn resolve() -> Result<Self, DecodeError> {
        gst::init().map_err(|e| DecodeError::Unavailable(e.to_string()))?;

        for name in REQUIRED_ELEMENTS {
            if gst::ElementFactory::find(name).is_none() {
                return Err(DecodeError::Unavailable(format!(
                    "GStreamer element '{}' not installed",
                    name
                )));
            }
        }

        info!(version = %gst::version_string(), "Resolved GStreamer decoder");
        Ok(Self)
    }
}

#[async_trait]
impl DecoderFactory for GstDecoder {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let (frame_tx, frame_rx) = mpsc::channel(2);
        let (fps_tx, fps_rx) = oneshot::channel();
        let path = path.to_path_buf();

        std::thread::Builder::new()
            .name("vigil-gst-decode".to_string())
            .spawn(move || run_pipeline(path, frame_tx, fps_tx))?;

        let fps = fps_rx
            .await
            .map_err(|_| DecodeError::Open("decode thread exited before preroll".to_string()))??;

        Ok(Box::new(GstSource {
            frames: frame_rx,
            fps,
            position: 0,
        }))
    }
}

struct GstSource {
    frames: mpsc::Receiver<Result<RgbFrame, DecodeError>>,
    fps: Option<f64>,
    position: u64,
}

#[async_trait]
impl FrameSource for GstSource {
    fn reported_fps(&self) -> Option<f64> {
        self.fps
    }

    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => {
                let decoded = DecodedFrame {
                    position: self.position,
                    width: frame.width,
                    height: frame.height,
                    data: frame.data,
                };
                self.position += 1;
                Ok(Some(decoded))
            }
            Some(Err(DecodeError::Stream { message, .. })) => Err(DecodeError::Stream {
                position: self.position,
                message,
            }),
            Some(Err(DecodeError::Truncated { expected, actual, .. })) => Err(DecodeError::Truncated {
                position: self.position,
                expected,
                actual,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct RgbFrame {
    width: u32,
    height: u32,
    data: Bytes,
}

type FrameSender = mpsc::Sender<Result<RgbFrame, DecodeError>>;

fn run_pipeline(
    path: PathBuf,
    frames: FrameSender,
    fps: oneshot::Sender<Result<Option<f64>, DecodeError>>,
) {
    let (pipeline, appsink) = match build_pipeline(&path) {
        Ok(built) => built,
        Err(e) => {
            let _ = fps.send(Err(e));
            return;
        }
    };

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        let _ = fps.send(Err(DecodeError::Open(e.to_string())));
        let _ = pipeline.set_state(gst::State::Null);
        return;
    }

    let mut fps = Some(fps);
    loop {
        let sample = match appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => {
                let outcome = if appsink.is_eos() {
                    debug!(path = %path.display(), "End of stream");
                    None
                } else {
                    Some(bus_error(&pipeline))
                };
                match (fps.take(), outcome) {
                    (Some(tx), Some(e)) => {
                        let _ = tx.send(Err(DecodeError::Open(e)));
                    }
                    (Some(tx), None) => {
                        let _ = tx.send(Ok(None));
                    }
                    (None, Some(e)) => {
                        let _ = frames.blocking_send(Err(DecodeError::Stream { position: 0, message: e }));
                    }
                    (None, None) => {}
                }
                break;
            }
        };

        let (frame, sample_fps) = match rgb_frame(&sample) {
            Ok(decoded) => decoded,
            Err((info_fps, e)) => {
                if let Some(tx) = fps.take() {
                    let _ = tx.send(Ok(info_fps));
                }
                let _ = frames.blocking_send(Err(e));
                break;
            }
        };

        if let Some(tx) = fps.take() {
            let _ = tx.send(Ok(sample_fps));
        }
        if frames.blocking_send(Ok(frame)).is_err() {
            // receiver dropped: job finished or was cancelled
            break;
        }
    }

    let _ = pipeline.set_state(gst::State::Null);
}

fn build_pipeline(path: &Path) -> Result<(gst::Pipeline, gst_app::AppSink), DecodeError> {
    let location = path
        .to_str()
        .ok_or_else(|| DecodeError::Open(format!("non UTF-8 path {}", path.display())))?;

    let filesrc = gst::ElementFactory::make("filesrc")
        .property("location", location)
        .build()
        .map_err(|e| DecodeError::Open(e.to_string()))?;
    let decodebin = gst::ElementFactory::make("decodebin")
        .build()
        .map_err(|e| DecodeError::Open(e.to_string()))?;
    let convert = gst::ElementFactory::make("videoconvert")
        .build()
        .map_err(|e| DecodeError::Open(e.to_string()))?;

    let appsink = gst_app::AppSink::builder()
        .caps(
            &gst_video::VideoCapsBuilder::new()
                .format(gst_video::VideoFormat::Rgb)
                .build(),
        )
        .sync(false)
        .max_buffers(2)
        .drop(false)
        .build();

    let pipeline = gst::Pipeline::new();
    pipeline
        .add_many([&filesrc, &decodebin, &convert, appsink.upcast_ref()])
        .map_err(|e| DecodeError::Open(e.to_string()))?;
    filesrc
        .link(&decodebin)
        .map_err(|e| DecodeError::Open(e.to_string()))?;
    convert
        .link(&appsink)
        .map_err(|e| DecodeError::Open(e.to_string()))?;

    // decodebin exposes its pads once the stream type is known
    let convert_weak = convert.downgrade();
    decodebin.connect_pad_added(move |_, src_pad| {
        let Some(convert) = convert_weak.upgrade() else {
            return;
        };
        let is_video = src_pad
            .current_caps()
            .and_then(|caps| caps.structure(0).map(|s| s.name().starts_with("video/")))
            .unwrap_or(false);
        if !is_video {
            return;
        }
        if let Some(sink_pad) = convert.static_pad("sink") {
            if !sink_pad.is_linked() {
                if let Err(e) = src_pad.link(&sink_pad) {
                    warn!(error = ?e, "Failed to link decoded video pad");
                }
            }
        }
    });

    Ok((pipeline, appsink))
}

/// Copy a sample into a tightly packed RGB24 frame, dropping row padding.
fn rgb_frame(sample: &gst::Sample) -> Result<(RgbFrame, Option<f64>), (Option<f64>, DecodeError)> {
    let caps = sample
        .caps()
        .ok_or_else(|| (None, DecodeError::Open("sample without caps".to_string())))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| (None, DecodeError::Open(e.to_string())))?;

    let rate = info.fps();
    let fps = (rate.numer() > 0 && rate.denom() > 0).then(|| rate.numer() as f64 / rate.denom() as f64);

    let buffer = sample
        .buffer()
        .ok_or_else(|| (fps, DecodeError::Stream { position: 0, message: "sample without buffer".to_string() }))?;
    let map = buffer
        .map_readable()
        .map_err(|e| (fps, DecodeError::Stream { position: 0, message: e.to_string() }))?;

    let width = info.width();
    let height = info.height();
    let row = width as usize * 3;
    let stride = info.stride()[0] as usize;
    let src = map.as_slice();

    let mut data = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let Some(line) = src.get(start..start + row) else {
            return Err((
                fps,
                DecodeError::Truncated {
                    position: 0,
                    expected: stride * height as usize,
                    actual: src.len(),
                },
            ));
        };
        data.extend_from_slice(line);
    }

    Ok((
        RgbFrame {
            width,
            height,
            data: Bytes::from(data),
        },
        fps,
    ))
}

fn bus_error(pipeline: &gst::Pipeline) -> String {
    let Some(bus) = pipeline.bus() else {
        return "pipeline stopped without a bus".to_string();
    };
    while let Some(msg) = bus.pop() {
        if let gst::MessageView::Error(err) = msg.view() {
            return format!("{} ({:?})", err.error(), err.debug());
        }
    }
    "pipeline stopped before end of stream".to_string()
}
