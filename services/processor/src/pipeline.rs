//! Job orchestration.
//!
//! [`JobRunner::run`] takes one source video through
//! size check, download, sampling and upload, classification, selection,
//! purge and alerting. Fatal errors end the job with a `failed` result;
//! everything else is folded into the [`JobSummary`]. The job's local
//! workspace is released on every path, including timeout and cancellation.

use crate::alert::{AlertDispatcher, Notifier};
use crate::classifier::{Classifier, ClassifierGateway, ClassifierInput, ImageInput};
use crate::config::Config;
use crate::frame_selector::select;
use crate::job::{FailureReason, Frame, FrameState, Job, JobError, JobResult, JobStatus, JobSummary};
use crate::object_store::{ObjectLocator, ObjectStore, StoreError};
use crate::resource_guard::{Reservation, ResourceError, ResourceGuard};
use crate::retention::RetentionManager;
use crate::s3_store::{content_type, frame_key};
use crate::sampler::{DecoderFactory, FrameSampler};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators shared by every job in the process.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn ObjectStore>,
    pub classifier: Arc<dyn Classifier>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub decoder: Arc<dyn DecoderFactory>,
}

/// Runs jobs against a fixed context and configuration.
pub struct JobRunner {
    ctx: PipelineContext,
    config: Arc<Config>,
    cancel: CancellationToken,
}

/// Frames sampled so far, plus what classification will need from them.
#[derive(Default)]
struct SampledFrames {
    frames: Vec<Frame>,
    /// In-memory JPEG copies kept for inline classification
    inline: HashMap<u64, (Bytes, Reservation)>,
}

impl SampledFrames {
    /// Drop the oldest inline copy. That frame is classified by reference.
    fn evict_inline(&mut self) -> bool {
        match self.inline.keys().min().copied() {
            Some(index) => {
                self.inline.remove(&index);
                true
            }
            None => false,
        }
    }
}

impl JobRunner {
    pub fn new(ctx: PipelineContext, config: Arc<Config>) -> Self {
        Self {
            ctx,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel running jobs when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run one job to completion. Always returns a result document.
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn run(&self, source: ObjectLocator) -> JobResult {
        let job = Job::new(source);
        let started = Instant::now();
        metrics::counter!("vigil.jobs.started").increment(1);
        info!(job_id = %job.job_id, "Job started");

        let guard = match ResourceGuard::create(job.job_id, &self.config.resources).await {
            Ok(guard) => guard,
            Err(e) => return Self::finish(&job, Err(e.into()), started),
        };

        let timeout = self.config.job_timeout();
        let outcome = tokio::select! {
            result = self.execute(&job, &guard) => result,
            _ = tokio::time::sleep(timeout) => Err(JobError::TimedOut(timeout)),
            _ = self.cancel.cancelled() => Err(JobError::Cancelled),
        };

        guard.release().await;
        Self::finish(&job, outcome, started)
    }

    fn finish(job: &Job, outcome: Result<JobSummary, JobError>, started: Instant) -> JobResult {
        let elapsed = started.elapsed();
        metrics::histogram!("vigil.job.duration_seconds").record(elapsed.as_secs_f64());

        let result = match outcome {
            Ok(summary) => JobResult::completed(job, summary),
            Err(e) => {
                error!(job_id = %job.job_id, kind = ?e.kind(), error = %e, "Job failed");
                JobResult::failed(job, &e)
            }
        };

        match result.status {
            JobStatus::Succeeded => metrics::counter!("vigil.jobs.succeeded").increment(1),
            JobStatus::Degraded => metrics::counter!("vigil.jobs.degraded").increment(1),
            JobStatus::Failed => metrics::counter!("vigil.jobs.failed").increment(1),
        }

        info!(
            job_id = %job.job_id,
            status = ?result.status,
            frames_sampled = result.frames_sampled,
            frames_retained = result.frames_retained,
            frames_deleted = result.frames_deleted,
            frames_unclassified = result.frames_unclassified,
            frames_upload_failed = result.frames_upload_failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job finished"
        );

        result
    }

    fn frame_bucket(&self, job: &Job) -> String {
        self.config
            .storage
            .frame_bucket
            .clone()
            .unwrap_or_else(|| job.source.container.clone())
    }

    fn retention(&self) -> RetentionManager {
        RetentionManager::new(
            Arc::clone(&self.ctx.store),
            self.config.delete_batch_size(),
            self.config.storage.delete_concurrency,
        )
    }

    async fn execute(&self, job: &Job, guard: &ResourceGuard) -> Result<JobSummary, JobError> {
        let source_unavailable = |e: StoreError| match e {
            StoreError::Io(io) => JobError::Workspace(io.to_string()),
            StoreError::LimitExceeded { limit, .. } => {
                JobError::ResourceExceeded(ResourceError::SourceGrew { reported: limit })
            }
            other => JobError::SourceUnavailable {
                object: job.source.clone(),
                reason: other.to_string(),
            },
        };

        // Metadata only: nothing is transferred until the size is known to fit.
        let size = self.ctx.store.head(&job.source).await.map_err(source_unavailable)?;
        guard.check_source_size(size)?;
        let video_bytes = guard.reserve(size)?;

        let extension = Path::new(job.source.file_name())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let video_path = guard.register(&format!("source.{}", extension));
        let downloaded = self
            .ctx
            .store
            .download_to(&job.source, &video_path, video_bytes.bytes())
            .await
            .map_err(source_unavailable)?;
        debug!(job_id = %job.job_id, bytes = downloaded, "Source downloaded");

        let bucket = self.frame_bucket(job);
        let mut sampled = SampledFrames::default();
        if let Err(e) = self.sample_and_upload(job, guard, &video_path, &bucket, &mut sampled).await {
            self.discard_uploaded(&bucket, &sampled.frames).await;
            return Err(e);
        }

        guard.discard(&video_path).await;
        drop(video_bytes);

        let SampledFrames { mut frames, inline } = sampled;
        if frames.is_empty() {
            info!(job_id = %job.job_id, "Video produced no frames");
            return Ok(JobSummary::empty());
        }

        // Classification
        let inputs: Vec<ClassifierInput> = frames
            .iter()
            .filter(|f| f.state() == FrameState::Uploaded)
            .map(|f| ClassifierInput {
                frame_index: f.index,
                image: match inline.get(&f.index) {
                    Some((bytes, _)) => ImageInput::Inline(bytes.clone()),
                    None => ImageInput::Stored(ObjectLocator::new(bucket.clone(), f.storage_key.clone())),
                },
            })
            .collect();
        drop(inline);

        let gateway = ClassifierGateway::new(
            Arc::clone(&self.ctx.classifier),
            self.config.classifier.batch_size,
            self.config.classifier.max_in_flight,
        );
        let classified = gateway.classify_frames(&inputs).await;

        for index in &classified.unclassified {
            if let Some(frame) = frames.get_mut(*index as usize) {
                frame.mark_failed(FailureReason::Classification);
            }
        }
        for detection in &classified.detections {
            if let Some(frame) = frames.get_mut(detection.frame_index as usize) {
                frame.mark_classified(detection.clone());
            }
        }

        // Selection runs once, over every classified frame, before any delete.
        let selection = select(&classified.detections, &self.config.selection_policy());
        for index in &selection.retained {
            if let Some(frame) = frames.get_mut(*index as usize) {
                frame.mark_retained();
            }
        }

        let retained_keys: HashSet<&str> = frames
            .iter()
            .filter(|f| f.state() == FrameState::Retained)
            .map(|f| f.storage_key.as_str())
            .collect();
        let to_delete: Vec<String> = selection
            .rejected
            .iter()
            .chain(classified.unclassified.iter())
            .filter_map(|index| frames.get(*index as usize))
            .map(|f| f.storage_key.clone())
            .collect();
        debug_assert!(to_delete.iter().all(|k| !retained_keys.contains(k.as_str())));
        drop(retained_keys);

        let purge = self.retention().purge(&bucket, &to_delete).await;
        let residual: HashSet<&str> = purge.residual.iter().map(String::as_str).collect();
        for index in &selection.rejected {
            if let Some(frame) = frames.get_mut(*index as usize) {
                if residual.contains(frame.storage_key.as_str()) {
                    frame.mark_failed(FailureReason::Delete);
                } else {
                    frame.mark_deleted();
                }
            }
        }
        drop(residual);

        // Alert
        let retained: Vec<ObjectLocator> = frames
            .iter()
            .filter(|f| f.state() == FrameState::Retained)
            .map(|f| ObjectLocator::new(bucket.clone(), f.storage_key.clone()))
            .collect();
        let dispatcher = AlertDispatcher::new(
            self.ctx.notifier.clone(),
            Arc::clone(&self.ctx.store),
            self.config.notification.topic_arn.clone(),
            self.config.notification.subject_prefix.clone(),
            self.config.presigned_url_expiry(),
        );
        let alert = dispatcher.dispatch(job, &retained).await;

        Ok(JobSummary::from_frames(&frames, purge.residual, alert))
    }

    /// Decode, sample and upload every frame. Upload failures are recorded on
    /// the frame; decode and workspace failures end the job.
    async fn sample_and_upload(
        &self,
        job: &Job,
        guard: &ResourceGuard,
        video_path: &Path,
        bucket: &str,
        sampled: &mut SampledFrames,
    ) -> Result<(), JobError> {
        let sampling = &self.config.sampling;
        let source = self.ctx.decoder.open(video_path).await?;
        let mut sampler = FrameSampler::new(
            source,
            sampling.sample_rate,
            sampling.fallback_source_fps,
            sampling.jpeg_quality,
        );
        let inline_images = self.config.classifier.inline_images;

        while let Some(frame) = sampler.next().await? {
            // Inline copies give way to the frame in hand; only the video and
            // a single frame must fit under the ceiling.
            let reservation = loop {
                match guard.reserve(frame.jpeg.len() as u64) {
                    Ok(reservation) => break reservation,
                    Err(e) => {
                        if !sampled.evict_inline() {
                            return Err(e.into());
                        }
                        debug!(frame_index = frame.index, "Ceiling reached, dropped an inline frame copy");
                    }
                }
            };
            let key = frame_key(
                &self.config.storage.frame_prefix,
                job.job_id,
                job.source.file_stem(),
                frame.index,
            );
            let mut record = Frame::new(frame.index, frame.source_offset, key);
            metrics::counter!("vigil.frames.sampled").increment(1);

            let target = ObjectLocator::new(bucket, record.storage_key.clone());
            match self.ctx.store.put(&target, frame.jpeg.clone(), content_type("jpg")).await {
                Ok(()) => {
                    record.mark_uploaded();
                    if inline_images {
                        sampled.inline.insert(frame.index, (frame.jpeg, reservation));
                    }
                }
                Err(e) => {
                    metrics::counter!("vigil.frames.upload_failed").increment(1);
                    warn!(
                        job_id = %job.job_id,
                        frame_index = frame.index,
                        key = %target.key,
                        error = %e,
                        "Frame upload failed"
                    );
                    record.mark_failed(FailureReason::Upload);
                }
            }
            sampled.frames.push(record);
        }

        info!(
            job_id = %job.job_id,
            interval = sampler.interval(),
            frames = sampled.frames.len(),
            inline = sampled.inline.len(),
            decoder = self.ctx.decoder.name(),
            "Sampling finished"
        );
        Ok(())
    }

    /// Remove frames uploaded by a job that then failed.
    async fn discard_uploaded(&self, bucket: &str, frames: &[Frame]) {
        let keys: Vec<String> = frames
            .iter()
            .filter(|f| f.state() == FrameState::Uploaded)
            .map(|f| f.storage_key.clone())
            .collect();
        if !keys.is_empty() {
            self.retention().purge(bucket, &keys).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertOutcome, MockNotifier};
    use crate::frame_selector::SelectionStrategy;
    use crate::job::ErrorKind;
    use crate::testing::{MemoryStore, ScriptedClassifier, SyntheticDecoder};
    use std::path::PathBuf;
    use std::time::Duration;
    use uuid::Uuid;

    const TOPIC: &str = "arn:aws:sns:us-east-1:123456789012:vigil-alerts";

    struct Harness {
        store: Arc<MemoryStore>,
        classifier: Arc<ScriptedClassifier>,
        work_root: PathBuf,
        config: Config,
    }

    impl Harness {
        fn new(classifier: ScriptedClassifier, strategy: SelectionStrategy) -> Self {
            let work_root = std::env::temp_dir().join(format!("vigil-pipeline-test-{}", Uuid::new_v4()));
            let mut config = Config::default();
            config.classifier.endpoint = "http://classifier.test/v1/predict".to_string();
            config.classifier.batch_size = 2;
            config.classifier.inline_images = false;
            config.selection.strategy = strategy;
            config.sampling.sample_rate = 1.0;
            config.storage.frame_bucket = Some("frames".to_string());
            config.resources.work_root = work_root.clone();
            config.resources.max_video_size_bytes = 1_000_000;
            config.resources.ephemeral_ceiling_bytes = 2_000_000;
            config.notification.topic_arn = Some(TOPIC.to_string());

            let store = Arc::new(MemoryStore::new());
            store.insert("raw", "uploads/highway-cam.mp4", Bytes::from(vec![0u8; 4_096]));

            Self {
                store,
                classifier: Arc::new(classifier),
                work_root,
                config,
            }
        }

        fn runner(&self, decoder: SyntheticDecoder, notifier: Option<MockNotifier>) -> JobRunner {
            let ctx = PipelineContext {
                store: self.store.clone(),
                classifier: self.classifier.clone(),
                notifier: notifier.map(|n| Arc::new(n) as Arc<dyn Notifier>),
                decoder: Arc::new(decoder),
            };
            JobRunner::new(ctx, Arc::new(self.config.clone()))
        }

        fn source() -> ObjectLocator {
            ObjectLocator::new("raw", "uploads/highway-cam.mp4")
        }

        fn workspace_is_clean(&self) -> bool {
            std::fs::read_dir(&self.work_root)
                .map(|entries| entries.count() == 0)
                .unwrap_or(true)
        }

        fn frame_keys(&self) -> Vec<String> {
            self.store.keys("frames")
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.work_root);
        }
    }

    fn publishing_notifier() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Ok("msg-0001".to_string()));
        notifier
    }

    fn silent_notifier() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier.expect_publish().never();
        notifier
    }

    #[tokio::test]
    async fn test_scenario_e_chunk_failure_degrades_job() {
        let classifier = ScriptedClassifier::new(
            &["crash", "normal", "crash", "normal", "crash", "normal"],
            &[0.95, 0.40, 0.99, 0.30, 0.93, 0.20],
        )
        .failing_for(&[2]);
        let harness = Harness::new(classifier, SelectionStrategy::MultiOrNothing);
        let runner = harness.runner(
            SyntheticDecoder::new(6).with_fps(1.0),
            Some(publishing_notifier()),
        );

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Degraded);
        assert_eq!(result.frames_sampled, 6);
        assert_eq!(result.frames_unclassified, 2);
        assert_eq!(result.frames_retained, 2);
        assert_eq!(result.frames_deleted, 2);
        assert_eq!(result.frames_upload_failed, 0);
        assert!(result.residual_delete_failures.is_empty());
        assert_eq!(
            result.alert,
            Some(AlertOutcome::Published {
                message_id: "msg-0001".to_string()
            })
        );
        assert_eq!(harness.classifier.calls().len(), 3);

        // only the retained frames are left under the job prefix
        let keys = harness.frame_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with(&format!("{}/highway-cam_frame_00000.jpg", result.job_id)));
        assert!(keys[1].ends_with("highway-cam_frame_00004.jpg"));
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_scenario_c_lone_event_retains_nothing() {
        let classifier = ScriptedClassifier::new(
            &["crash", "crash", "crash", "crash", "normal"],
            &[0.85, 0.80, 0.99, 0.70, 0.50],
        );
        let harness = Harness::new(classifier, SelectionStrategy::MultiOrNothing);
        let runner = harness.runner(SyntheticDecoder::new(5).with_fps(1.0), Some(silent_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.frames_retained, 0);
        assert_eq!(result.frames_deleted, 5);
        assert_eq!(result.alert, Some(AlertOutcome::Skipped));
        assert!(harness.frame_keys().is_empty());
    }

    #[tokio::test]
    async fn test_single_best_keeps_one_frame() {
        let classifier = ScriptedClassifier::new(
            &["normal", "normal", "crash", "normal"],
            &[0.30, 0.97, 0.60, 0.20],
        );
        let harness = Harness::new(classifier, SelectionStrategy::SingleBest);
        let runner = harness.runner(SyntheticDecoder::new(4).with_fps(1.0), Some(publishing_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.frames_retained, 1);
        assert_eq!(result.frames_deleted, 3);
        let keys = harness.frame_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("highway-cam_frame_00001.jpg"));
    }

    #[tokio::test]
    async fn test_scenario_d_oversized_video_is_never_downloaded() {
        let harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::SingleBest);
        harness.store.set_reported_size("uploads/highway-cam.mp4", 5_000_000);
        let runner = harness.runner(SyntheticDecoder::new(30), Some(silent_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::ResourceExceeded));
        assert_eq!(harness.store.get_calls(), 0);
        assert!(harness.classifier.calls().is_empty());
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_source_larger_than_reported_is_not_kept() {
        let mut harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::SingleBest);
        harness.config.resources.max_video_size_bytes = 1_000;
        harness.config.resources.ephemeral_ceiling_bytes = 1_000;
        // object replaced between the size check and the download
        harness.store.set_reported_size("uploads/highway-cam.mp4", 100);
        let runner = harness.runner(SyntheticDecoder::new(3).with_fps(1.0), Some(silent_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::ResourceExceeded));
        assert!(harness.frame_keys().is_empty());
        assert!(harness.classifier.calls().is_empty());
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_inline_copies_yield_to_ceiling() {
        let mut harness = Harness::new(ScriptedClassifier::uniform("crash", 0.95), SelectionStrategy::SingleBest);
        harness.config.classifier.inline_images = true;
        harness.config.resources.ephemeral_ceiling_bytes = 4_096 + 1_500;
        let runner = harness.runner(SyntheticDecoder::new(10).with_fps(1.0), Some(publishing_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.frames_sampled, 10);
        assert_eq!(result.frames_unclassified, 0);
        assert_eq!(result.frames_retained, 1);

        // every frame was classified, the evicted ones by reference
        let sent: usize = harness.classifier.calls().iter().map(Vec::len).sum();
        assert_eq!(sent, 10);
        let inline = harness.classifier.inline_images_seen();
        assert!(inline >= 1 && inline < 10, "inline images: {}", inline);
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_missing_source_fails_job() {
        let harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::SingleBest);
        let runner = harness.runner(SyntheticDecoder::new(30), None);

        let result = runner
            .run(ObjectLocator::new("raw", "uploads/missing.mp4"))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::SourceUnavailable));
        assert_eq!(result.alert, None);
    }

    #[tokio::test]
    async fn test_empty_video_short_circuits() {
        let harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::SingleBest);
        let runner = harness.runner(SyntheticDecoder::new(0), Some(silent_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.frames_sampled, 0);
        assert_eq!(result.alert, Some(AlertOutcome::Skipped));
        assert!(harness.classifier.calls().is_empty());
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_decode_error_fails_job_and_discards_frames() {
        let harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::SingleBest);
        let runner = harness.runner(
            SyntheticDecoder::new(10).with_fps(1.0).failing_at(4),
            Some(silent_notifier()),
        );

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::DecodeError));
        assert!(harness.frame_keys().is_empty());
        assert!(harness.classifier.calls().is_empty());
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_upload_failure_excludes_frame() {
        let harness = Harness::new(ScriptedClassifier::uniform("crash", 0.99), SelectionStrategy::MultiOrNothing);
        harness.store.fail_put("_frame_00001.jpg");
        let runner = harness.runner(SyntheticDecoder::new(3).with_fps(1.0), Some(publishing_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Degraded);
        assert_eq!(result.frames_upload_failed, 1);
        assert_eq!(result.frames_retained, 2);
        let classified: Vec<u64> = harness.classifier.calls().concat();
        assert_eq!(classified, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_residual_deletes_degrade_job() {
        let classifier = ScriptedClassifier::new(&["crash", "normal", "normal"], &[0.99, 0.50, 0.40]);
        let harness = Harness::new(classifier, SelectionStrategy::SingleBest);
        harness.store.refuse_delete_matching("_frame_00002.jpg");
        let runner = harness.runner(SyntheticDecoder::new(3).with_fps(1.0), Some(publishing_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Degraded);
        assert_eq!(result.frames_retained, 1);
        assert_eq!(result.frames_deleted, 1);
        assert_eq!(result.residual_delete_failures.len(), 1);
        assert!(result.residual_delete_failures[0].ends_with("_frame_00002.jpg"));
    }

    #[tokio::test]
    async fn test_inline_images_are_sent_to_classifier() {
        let mut harness = Harness::new(ScriptedClassifier::uniform("crash", 0.95), SelectionStrategy::SingleBest);
        harness.config.classifier.inline_images = true;
        let runner = harness.runner(SyntheticDecoder::new(2).with_fps(1.0), Some(publishing_notifier()));

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(harness.classifier.inline_images_seen(), 2);
        assert_eq!(result.frames_retained, 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_workspace() {
        let harness = Harness::new(
            ScriptedClassifier::uniform("crash", 0.99).with_delay(Duration::from_secs(30)),
            SelectionStrategy::SingleBest,
        );
        let token = CancellationToken::new();
        let runner = harness
            .runner(SyntheticDecoder::new(3).with_fps(1.0), None)
            .with_cancellation(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let result = runner.run(Harness::source()).await;
        cancel.await.unwrap();

        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
        assert!(harness.workspace_is_clean());
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let mut harness = Harness::new(
            ScriptedClassifier::uniform("crash", 0.99).with_delay(Duration::from_secs(30)),
            SelectionStrategy::SingleBest,
        );
        harness.config.resources.job_timeout_secs = 1;
        let runner = harness.runner(SyntheticDecoder::new(3).with_fps(1.0), None);

        let result = runner.run(Harness::source()).await;

        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::TimedOut));
        assert!(harness.workspace_is_clean());
    }
}
