//! In-memory fakes for the storage, classifier and decoder seams.

use crate::classifier::{Classification, Classifier, ClassifierError, ImageInput};
use crate::object_store::{DeleteOutcome, ObjectLocator, ObjectStore, StoreError};
use crate::sampler::{DecodeError, DecodedFrame, DecoderFactory, FrameSource};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Counts calls in progress and remembers the highest count seen.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { tracker: self }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a> {
    tracker: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object store held in a map keyed by `(container, key)`.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    reported_sizes: Mutex<HashMap<String, u64>>,
    failing_puts: Mutex<Vec<String>>,
    refused: Mutex<HashSet<String>>,
    refused_suffixes: Mutex<Vec<String>>,
    failing_delete_requests: AtomicUsize,
    delete_calls: Mutex<Vec<Vec<String>>>,
    delete_delay: Mutex<Option<Duration>>,
    deletes_in_flight: InFlight,
    get_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container: &str, key: &str, body: Bytes) {
        self.objects
            .lock()
            .insert((container.to_string(), key.to_string()), body);
    }

    pub fn contains(&self, container: &str, key: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(container.to_string(), key.to_string()))
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Sorted keys stored in `container`.
    pub fn keys(&self, container: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Make `head` report `size` for `key` regardless of its body.
    pub fn set_reported_size(&self, key: &str, size: u64) {
        self.reported_sizes.lock().insert(key.to_string(), size);
    }

    /// Reject uploads whose key ends with `suffix`.
    pub fn fail_put(&self, suffix: &str) {
        self.failing_puts.lock().push(suffix.to_string());
    }

    /// Fail the next `count` delete requests outright.
    pub fn fail_delete_requests(&self, count: usize) {
        self.failing_delete_requests.store(count, Ordering::SeqCst);
    }

    /// Report `key` as failed in every delete request.
    pub fn refuse_delete(&self, key: &str) {
        self.refused.lock().insert(key.to_string());
    }

    /// Report every key ending with `suffix` as failed.
    pub fn refuse_delete_matching(&self, suffix: &str) {
        self.refused_suffixes.lock().push(suffix.to_string());
    }

    /// Hold every delete request open for `delay`.
    pub fn delay_deletes(&self, delay: Duration) {
        *self.delete_delay.lock() = Some(delay);
    }

    pub fn peak_deletes_in_flight(&self) -> usize {
        self.deletes_in_flight.peak()
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.delete_calls.lock().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn is_refused(&self, key: &str) -> bool {
        self.refused.lock().contains(key)
            || self.refused_suffixes.lock().iter().any(|s| key.ends_with(s.as_str()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, object: &ObjectLocator) -> Result<u64, StoreError> {
        let len = self
            .objects
            .lock()
            .get(&(object.container.clone(), object.key.clone()))
            .map(|body| body.len() as u64)
            .ok_or_else(|| StoreError::NotFound(object.to_string()))?;
        Ok(self.reported_sizes.lock().get(&object.key).copied().unwrap_or(len))
    }

    async fn get(&self, object: &ObjectLocator) -> Result<Bytes, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .get(&(object.container.clone(), object.key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(object.to_string()))
    }

    async fn put(&self, object: &ObjectLocator, body: Bytes, _content_type: &str) -> Result<(), StoreError> {
        if self
            .failing_puts
            .lock()
            .iter()
            .any(|s| object.key.ends_with(s.as_str()))
        {
            return Err(StoreError::Request(format!("put rejected for {}", object)));
        }
        self.insert(&object.container, &object.key, body);
        Ok(())
    }

    async fn delete_batch(&self, container: &str, keys: &[String]) -> Result<DeleteOutcome, StoreError> {
        self.delete_calls.lock().push(keys.to_vec());
        let _in_flight = self.deletes_in_flight.enter();
        let delay = *self.delete_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failing_delete_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Request("service unavailable".to_string()));
        }

        let mut failed = Vec::new();
        for key in keys {
            if self.is_refused(key) {
                failed.push((key.clone(), "AccessDenied".to_string()));
            } else {
                self.objects.lock().remove(&(container.to_string(), key.clone()));
            }
        }
        Ok(DeleteOutcome { failed })
    }

    async fn presign(&self, object: &ObjectLocator, ttl: Duration) -> Result<String, StoreError> {
        Ok(format!(
            "https://memory.local/{}/{}?expires={}",
            object.container,
            object.key,
            ttl.as_secs()
        ))
    }
}

/// Classifier answering from a per-frame script.
///
/// Frames are identified by the `_frame_NNNNN` suffix of stored references;
/// inline images and unscripted frames get the default answer.
pub struct ScriptedClassifier {
    script: Vec<(String, f32)>,
    default: (String, f32),
    failing: HashSet<u64>,
    descending_delays: bool,
    drop_last: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<u64>>>,
    inline_seen: AtomicUsize,
    in_flight: InFlight,
}

impl ScriptedClassifier {
    pub fn new(labels: &[&str], confidences: &[f32]) -> Self {
        let script = labels
            .iter()
            .zip(confidences)
            .map(|(label, confidence)| (label.to_string(), *confidence))
            .collect();
        Self {
            script,
            default: ("background".to_string(), 0.1),
            failing: HashSet::new(),
            descending_delays: false,
            drop_last: false,
            delay: None,
            calls: Mutex::new(Vec::new()),
            inline_seen: AtomicUsize::new(0),
            in_flight: InFlight::default(),
        }
    }

    /// Same answer for every frame.
    pub fn uniform(label: &str, confidence: f32) -> Self {
        let mut classifier = Self::new(&[], &[]);
        classifier.default = (label.to_string(), confidence);
        classifier
    }

    /// Fail every request containing one of `frames`.
    pub fn failing_for(mut self, frames: &[u64]) -> Self {
        self.failing.extend(frames.iter().copied());
        self
    }

    /// Requests for earlier frames take longer.
    pub fn with_descending_delays(mut self) -> Self {
        self.descending_delays = true;
        self
    }

    /// Return one result fewer than requested.
    pub fn dropping_last_result(mut self) -> Self {
        self.drop_last = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Frame indices of each request, in call order.
    pub fn calls(&self) -> Vec<Vec<u64>> {
        self.calls.lock().clone()
    }

    /// Most requests that were ever open at once.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak()
    }

    pub fn inline_images_seen(&self) -> usize {
        self.inline_seen.load(Ordering::SeqCst)
    }

    fn answer(&self, frame: Option<u64>) -> Classification {
        let (label, confidence) = frame
            .and_then(|i| self.script.get(i as usize))
            .unwrap_or(&self.default)
            .clone();
        Classification {
            label,
            confidence,
            labels: Vec::new(),
            boxes: Vec::new(),
        }
    }
}

fn frame_index_of(image: &ImageInput) -> Option<u64> {
    match image {
        ImageInput::Stored(object) => {
            let (_, tail) = object.key.rsplit_once("_frame_")?;
            tail.trim_end_matches(".jpg").parse().ok()
        }
        ImageInput::Inline(_) => None,
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, batch: &[ImageInput]) -> Result<Vec<Classification>, ClassifierError> {
        let frames: Vec<Option<u64>> = batch.iter().map(frame_index_of).collect();
        let inline = batch.iter().filter(|i| matches!(i, ImageInput::Inline(_))).count();
        self.inline_seen.fetch_add(inline, Ordering::SeqCst);
        self.calls
            .lock()
            .push(frames.iter().map(|f| f.unwrap_or(u64::MAX)).collect());
        let _in_flight = self.in_flight.enter();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.descending_delays {
            let first = frames.first().copied().flatten().unwrap_or(0).min(20);
            tokio::time::sleep(Duration::from_millis(5 * (20 - first))).await;
        }

        if frames.iter().flatten().any(|f| self.failing.contains(f)) {
            return Err(ClassifierError::Status {
                status: 503,
                body: "model overloaded".to_string(),
            });
        }

        let mut results: Vec<Classification> = frames.iter().map(|f| self.answer(*f)).collect();
        if self.drop_last {
            results.pop();
        }
        Ok(results)
    }
}

/// Decoder producing small solid-colour frames.
#[derive(Debug, Clone)]
pub struct SyntheticDecoder {
    frames: u64,
    fps: Option<f64>,
    fail_at: Option<u64>,
}

impl SyntheticDecoder {
    const WIDTH: u32 = 4;
    const HEIGHT: u32 = 4;

    pub fn new(frames: u64) -> Self {
        Self {
            frames,
            fps: None,
            fail_at: None,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Fail with a stream error when decode position `position` is reached.
    pub fn failing_at(mut self, position: u64) -> Self {
        self.fail_at = Some(position);
        self
    }

    pub fn into_source(self) -> Box<dyn FrameSource> {
        Box::new(SyntheticSource {
            decoder: self,
            position: 0,
        })
    }
}

#[async_trait]
impl DecoderFactory for SyntheticDecoder {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        if !tokio::fs::try_exists(path).await? {
            return Err(DecodeError::Open(format!("{} does not exist", path.display())));
        }
        Ok(self.clone().into_source())
    }
}

struct SyntheticSource {
    decoder: SyntheticDecoder,
    position: u64,
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn reported_fps(&self) -> Option<f64> {
        self.decoder.fps
    }

    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        if self.decoder.fail_at == Some(self.position) {
            return Err(DecodeError::Stream {
                position: self.position,
                message: "corrupt packet".to_string(),
            });
        }
        if self.position >= self.decoder.frames {
            return Ok(None);
        }

        let shade = (self.position % 256) as u8;
        let len = (SyntheticDecoder::WIDTH * SyntheticDecoder::HEIGHT * 3) as usize;
        let frame = DecodedFrame {
            position: self.position,
            width: SyntheticDecoder::WIDTH,
            height: SyntheticDecoder::HEIGHT,
            data: Bytes::from(vec![shade; len]),
        };
        self.position += 1;
        Ok(Some(frame))
    }
}
