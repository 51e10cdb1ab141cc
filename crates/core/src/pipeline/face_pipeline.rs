use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use super::pipeline_event::{AnnotatedFace, AnnotationClass, ErrorStage, PipelineEvent};
use super::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use super::recognition_stages::{apply_reset, run_feature, run_liveness, StageContext};
use super::stability_buffer::StabilityBuffer;
use crate::engine::domain::engine_error::EngineError;
use crate::engine::domain::engine_handle::EngineHandle;
use crate::engine::domain::face_engine::{
    DetectedFace, DetectionEngine, FaceFeature, FaceId, FeatureEngine, LivenessEngine,
    LivenessThresholds, MaskState,
};
use crate::recognition::domain::enroller::Enroller;
use crate::recognition::domain::identity_gallery::IdentityGallery;
use crate::recognition::domain::matching_service::{MatchError, MatchingService};
use crate::recognition::domain::recognition_registry::RecognitionRegistry;
use crate::recognition::domain::recognize_entry::{
    EntrySnapshot, LivenessState, RecognizeEntry, RecognizeStatus,
};
use crate::recognition::infrastructure::retry_scheduler::RetryScheduler;
use crate::recognition::infrastructure::worker_pool::WorkerPool;
use crate::shared::config::{ConfigError, RecognitionConfig};
use crate::shared::constants::{FEATURE_WORKER_NAME, LIVENESS_WORKER_NAME};
use crate::shared::frame::Frame;
use crate::tracking::domain::face_tracker::{FaceObservation, FaceTracker, TrackerEvent};
use crate::tracking::domain::rect_transformer::RectTransformer;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("liveness engine rejected thresholds: {0}")]
    Thresholds(#[source] EngineError),
    #[error("{handle} engine rejected orientation: {source}")]
    Orientation {
        handle: &'static str,
        #[source]
        source: EngineError,
    },
    #[error("pipeline has been shut down")]
    ShutDown,
}

/// The three independently locked engine sub-handles.
pub struct PipelineEngines {
    pub detection: Box<dyn DetectionEngine>,
    pub liveness: Box<dyn LivenessEngine>,
    pub feature: Box<dyn FeatureEngine>,
}

/// Per-frame entry point of the recognition pipeline.
///
/// `process_frame` runs on the caller's thread and never waits for analysis
/// results: liveness and feature work is handed to two bounded worker
/// pools, which report back into the registry. Everything the consumer
/// sees arrives as `PipelineEvent`s on the receiver returned by `new`.
pub struct FacePipeline {
    config: Arc<RecognitionConfig>,
    detection: Arc<EngineHandle<dyn DetectionEngine>>,
    registry: Arc<RecognitionRegistry>,
    scheduler: Arc<RetryScheduler>,
    stages: Arc<StageContext>,
    liveness_pool: WorkerPool,
    feature_pool: WorkerPool,
    tracker: FaceTracker,
    stability: StabilityBuffer,
    events: Sender<PipelineEvent>,
    ir_frame: Option<Arc<Frame>>,
    paused: bool,
    cancelled: Arc<AtomicBool>,
    logger: Box<dyn PipelineLogger>,
    frames: usize,
    shut_down: bool,
}

impl FacePipeline {
    /// Validates `config`, pushes orientation and liveness thresholds to
    /// the engine and starts the worker pools and retry timer.
    ///
    /// Without a gallery, recognition is switched off unless the pipeline
    /// runs in registration mode (`enable_compare == false`).
    pub fn new(
        config: RecognitionConfig,
        engines: PipelineEngines,
        gallery: Option<Arc<dyn IdentityGallery>>,
    ) -> Result<(Self, Receiver<PipelineEvent>), PipelineError> {
        config.validate()?;
        let mut config = config;
        if config.enable_recognize && config.enable_compare && gallery.is_none() {
            log::warn!("no identity gallery supplied, recognition disabled");
            config.enable_recognize = false;
        }
        let config = Arc::new(config);

        let PipelineEngines {
            mut detection,
            mut liveness,
            mut feature,
        } = engines;

        let orientation = config.detect_orientation;
        detection
            .set_orientation(orientation)
            .map_err(|source| PipelineError::Orientation {
                handle: "detection",
                source,
            })?;
        liveness
            .set_orientation(orientation.single())
            .map_err(|source| PipelineError::Orientation {
                handle: "liveness",
                source,
            })?;
        feature
            .set_orientation(orientation.single())
            .map_err(|source| PipelineError::Orientation {
                handle: "feature",
                source,
            })?;
        log::info!("detect orientation {orientation:?}");

        let thresholds = LivenessThresholds {
            rgb: config.rgb_liveness_threshold,
            ir: config.ir_liveness_threshold,
            face_quality: config.fq_liveness_threshold,
        };
        liveness
            .set_thresholds(thresholds)
            .map_err(PipelineError::Thresholds)?;
        log::info!(
            "liveness thresholds rgb={} ir={} fq={}",
            thresholds.rgb,
            thresholds.ir,
            thresholds.face_quality
        );

        let detection = Arc::new(EngineHandle::new("detection", detection));
        let liveness_engine = Arc::new(EngineHandle::new("liveness", liveness));
        let feature_engine = Arc::new(EngineHandle::new("feature", feature));

        let registry = Arc::new(RecognitionRegistry::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let (events, receiver) = crossbeam_channel::unbounded();

        let sink_registry = Arc::clone(&registry);
        let scheduler = Arc::new(
            RetryScheduler::start(Box::new(move |task| apply_reset(&sink_registry, task)))
                .map_err(|source| PipelineError::Spawn {
                    name: "retry scheduler",
                    source,
                })?,
        );

        let spawn_pool = |name: &'static str| {
            WorkerPool::new(name, config.max_faces, Arc::clone(&cancelled))
                .map_err(|source| PipelineError::Spawn { name, source })
        };
        let liveness_pool = spawn_pool(LIVENESS_WORKER_NAME)?;
        let feature_pool = spawn_pool(FEATURE_WORKER_NAME)?;

        let stages = Arc::new(StageContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            scheduler: Arc::clone(&scheduler),
            liveness_engine,
            matcher: MatchingService::new(Arc::clone(&feature_engine)),
            feature_engine,
            gallery,
            events: events.clone(),
            cancelled: Arc::clone(&cancelled),
        });

        let pipeline = Self {
            tracker: FaceTracker::new(Arc::clone(&config)),
            config,
            detection,
            registry,
            scheduler,
            stages,
            liveness_pool,
            feature_pool,
            stability: StabilityBuffer::default(),
            events,
            ir_frame: None,
            paused: false,
            cancelled,
            logger: Box::new(NullPipelineLogger),
            frames: 0,
            shut_down: false,
        };
        Ok((pipeline, receiver))
    }

    pub fn with_logger(mut self, logger: Box<dyn PipelineLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Processes one visible-light frame to completion.
    ///
    /// Per-face failures never escape; the only error is use after
    /// shutdown.
    pub fn process_frame(&mut self, frame: Frame) -> Result<(), PipelineError> {
        if self.shut_down {
            return Err(PipelineError::ShutDown);
        }
        if self.paused {
            return Ok(());
        }
        let frame = Arc::new(frame);
        self.frames += 1;
        self.logger.frame_processed(self.frames);

        let start = Instant::now();
        let detected = self.detection.call(|e| e.detect(&frame));
        self.logger.stage_timing("detect", elapsed_ms(start));
        let mut faces = match detected {
            Ok(faces) => faces,
            Err(err) => {
                self.report_error(ErrorStage::DetectFaces, err);
                return Ok(());
            }
        };

        for event in self.tracker.observe_population(&faces) {
            self.emit(match event {
                TrackerEvent::PopulationChanged { present } => {
                    PipelineEvent::PopulationChanged { present }
                }
                TrackerEvent::FaceCountChanged { count, face_ids } => {
                    PipelineEvent::FaceCountChanged { count, face_ids }
                }
            });
        }

        self.tracker.collapse(&mut faces);
        let masks = self.detect_masks(&frame, &faces);

        let transformer = RectTransformer::for_frame(&self.config, (frame.width(), frame.height()));
        let observations = self.tracker.observe(&faces, &masks, &transformer);

        self.update_stability(&observations, &frame);

        if self.config.enable_recognize {
            let mut drops = 0;
            for observation in observations.iter().filter(|o| o.is_valid()) {
                drops += self.submit(observation, &frame);
            }
            self.logger.gauge("queue_drops", drops as f64);
        }

        self.remove_departed(&observations);
        self.publish(frame.index(), &observations);
        self.logger.gauge("tracked_faces", self.registry.len() as f64);
        Ok(())
    }

    /// Replaces the infra-red frame used by IR liveness.
    pub fn refresh_ir_frame(&mut self, ir_frame: Frame) {
        self.ir_frame = Some(Arc::new(ir_frame));
    }

    /// While paused, frames are ignored; tracked state is kept.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        log::info!("detection {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tracked_faces(&self) -> usize {
        self.registry.len()
    }

    pub fn entry(&self, face_id: FaceId) -> Option<EntrySnapshot> {
        self.registry.get(face_id).map(|e| e.snapshot())
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.registry.snapshots()
    }

    /// 1:1 comparison through the feature sub-handle.
    pub fn compare_features(&self, a: &FaceFeature, b: &FaceFeature) -> Result<f32, MatchError> {
        self.stages.matcher.compare_one(a, b)
    }

    /// Enrollment helper sharing this pipeline's engine handles.
    pub fn enroller(&self) -> Enroller {
        Enroller::new(
            Arc::clone(&self.detection),
            Arc::clone(&self.stages.feature_engine),
        )
    }

    /// Stops workers, wakes blocked tasks and releases the engines.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.cancelled.store(true, Ordering::SeqCst);

        self.registry.clear();
        self.liveness_pool.shutdown();
        self.feature_pool.shutdown();
        self.scheduler.shutdown();

        self.detection.call(|e| e.release());
        self.stages.liveness_engine.call(|e| e.release());
        self.stages.feature_engine.call(|e| e.release());

        self.logger.summary();
        log::info!("pipeline stopped after {} frames", self.frames);
    }

    fn detect_masks(&mut self, frame: &Frame, faces: &[DetectedFace]) -> Vec<MaskState> {
        if !self.config.enable_mask || faces.is_empty() {
            return Vec::new();
        }
        let start = Instant::now();
        let result = self.detection.call(|e| e.detect_mask(frame, faces));
        self.logger.stage_timing("mask", elapsed_ms(start));
        match result {
            Ok(masks) => masks,
            Err(err) => {
                self.report_error(ErrorStage::DetectMask, err);
                Vec::new()
            }
        }
    }

    fn update_stability(&mut self, observations: &[FaceObservation], frame: &Arc<Frame>) {
        for observation in observations.iter().filter(|o| o.size_ok) {
            if !observation.area_valid {
                self.emit(PipelineEvent::OutsideRecognitionArea {
                    face_id: observation.face_id,
                });
                continue;
            }
            if let Some(stable) = self
                .stability
                .offer(observation.face_id, observation.mask, frame)
            {
                log::debug!("face {} stable", stable.face_id);
                self.emit(PipelineEvent::StableDetection {
                    face_id: stable.face_id,
                    mask: stable.mask,
                    frame: stable.frame,
                });
            }
        }
    }

    /// Hands a valid face to whichever stages it needs. Returns the number
    /// of submissions dropped because a queue was full.
    fn submit(&self, observation: &FaceObservation, frame: &Arc<Frame>) -> usize {
        if self.config.enable_mask && observation.mask == MaskState::Unknown {
            return 0;
        }
        let entry = self.registry.get_or_create(observation.face_id);
        let mut drops = 0;

        if self.config.liveness_enabled()
            && entry.recognize_status() != RecognizeStatus::Succeeded
            && entry.liveness() == LivenessState::Unknown
        {
            if self.liveness_pool.is_full() {
                log::warn!("liveness queue full, skipping face {}", observation.face_id);
                entry.set_message("DetectInfoThread is full.");
                drops += 1;
            } else if entry.begin_liveness() {
                let job = self.liveness_job(&entry, *observation, frame);
                if let Err(err) = self.liveness_pool.submit(job) {
                    log::warn!("face {}: {err}", observation.face_id);
                    entry.abandon_liveness();
                }
            }
        }

        if entry.recognize_status() == RecognizeStatus::ToRetry {
            if self.feature_pool.is_full() {
                log::warn!("feature queue full, skipping face {}", observation.face_id);
                entry.set_message("FeatureThread is full.");
                drops += 1;
            } else if entry.begin_search() {
                let job = self.feature_job(&entry, *observation, frame);
                if let Err(err) = self.feature_pool.submit(job) {
                    log::warn!("face {}: {err}", observation.face_id);
                    entry.abandon_search();
                }
            }
        }
        drops
    }

    fn liveness_job(
        &self,
        entry: &Arc<RecognizeEntry>,
        observation: FaceObservation,
        frame: &Arc<Frame>,
    ) -> Box<dyn FnOnce() + Send> {
        let ctx = Arc::clone(&self.stages);
        let entry = Arc::clone(entry);
        let frame = Arc::clone(frame);
        let ir_frame = self.ir_frame.clone();
        Box::new(move || run_liveness(&ctx, entry, observation, frame, ir_frame))
    }

    fn feature_job(
        &self,
        entry: &Arc<RecognizeEntry>,
        observation: FaceObservation,
        frame: &Arc<Frame>,
    ) -> Box<dyn FnOnce() + Send> {
        let ctx = Arc::clone(&self.stages);
        let entry = Arc::clone(entry);
        let frame = Arc::clone(frame);
        Box::new(move || run_feature(&ctx, entry, observation, frame))
    }

    fn remove_departed(&self, observations: &[FaceObservation]) {
        let live: HashSet<FaceId> = observations.iter().map(|o| o.face_id).collect();
        for entry in self.registry.retain(&live) {
            self.scheduler.cancel(entry.face_id(), entry.epoch());
        }
    }

    fn publish(&self, frame_index: usize, observations: &[FaceObservation]) {
        let faces = observations
            .iter()
            .map(|observation| {
                let entry = self.registry.get_or_create(observation.face_id).snapshot();
                AnnotatedFace {
                    observation: *observation,
                    class: AnnotationClass::of(&entry),
                    entry,
                }
            })
            .collect();
        self.emit(PipelineEvent::FrameAnnotated { frame_index, faces });
    }

    fn report_error(&self, stage: ErrorStage, err: EngineError) {
        log::error!("{stage} failed: {err}");
        self.emit(PipelineEvent::Error {
            stage,
            code: err.code,
            message: err.describe().to_string(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }
}

impl Drop for FacePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::domain::face_engine::{ExtractPurpose, LivenessVerdict};
    use crate::engine::infrastructure::scripted_engine::{encode_feature, ScriptedEngine};
    use crate::pipeline::pipeline_logger::LogPipelineLogger;
    use crate::recognition::domain::identity_gallery::{EnrolledFace, StaticGallery};
    use crate::shared::config::{LivenessType, Orientation};
    use crate::shared::face_rect::FaceRect;
    use std::thread;
    use std::time::Duration;

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 480;
    const DEADLINE: Duration = Duration::from_secs(5);

    fn face(face_id: FaceId, x: i32) -> DetectedFace {
        DetectedFace {
            face_id,
            rect: FaceRect::new(x, 100, 200, 200),
        }
    }

    /// Scripts the same faces for every frame index in `frames`.
    fn script_frames(
        engine: ScriptedEngine,
        frames: std::ops::Range<usize>,
        faces: &[DetectedFace],
    ) -> ScriptedEngine {
        frames.fold(engine, |engine, index| {
            engine.with_detections(index, faces.to_vec())
        })
    }

    fn engines(engine: &ScriptedEngine) -> PipelineEngines {
        PipelineEngines {
            detection: Box::new(engine.clone()),
            liveness: Box::new(engine.clone()),
            feature: Box::new(engine.clone()),
        }
    }

    fn gallery_of(entries: &[(u64, &str, Vec<f32>)]) -> Option<Arc<dyn IdentityGallery>> {
        let faces = entries
            .iter()
            .map(|(id, name, values)| EnrolledFace {
                id: *id,
                name: name.to_string(),
                feature: encode_feature(values),
            })
            .collect();
        Some(Arc::new(StaticGallery::new(faces, 0.8)))
    }

    /// Face 1's default feature is `[1.0, 1.0]`.
    fn alice() -> Option<Arc<dyn IdentityGallery>> {
        gallery_of(&[(7, "alice", vec![1.0, 1.0])])
    }

    fn quick_config() -> RecognitionConfig {
        RecognitionConfig {
            recognize_failed_retry_interval_ms: 100,
            liveness_failed_retry_interval_ms: 100,
            ..Default::default()
        }
    }

    /// Feeds frames from `start` until `done` holds or the deadline passes.
    /// Returns the index of the next unfed frame.
    fn feed_until(
        pipeline: &mut FacePipeline,
        start: usize,
        mut done: impl FnMut(&FacePipeline) -> bool,
    ) -> usize {
        let deadline = Instant::now() + DEADLINE;
        let mut index = start;
        while !done(pipeline) {
            assert!(Instant::now() < deadline, "condition not reached by frame {index}");
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
            index += 1;
            thread::sleep(Duration::from_millis(5));
        }
        index
    }

    fn status_of(pipeline: &FacePipeline, face_id: FaceId) -> Option<RecognizeStatus> {
        pipeline.entry(face_id).map(|e| e.recognize_status)
    }

    fn drain(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        events.try_iter().collect()
    }

    fn annotated_entries(events: &[PipelineEvent], face_id: FaceId) -> Vec<EntrySnapshot> {
        events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::FrameAnnotated { faces, .. } => faces
                    .iter()
                    .find(|f| f.observation.face_id == face_id)
                    .map(|f| f.entry.clone()),
                _ => None,
            })
            .collect()
    }

    fn error_stages(events: &[PipelineEvent]) -> Vec<ErrorStage> {
        events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::Error { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_matched_face_succeeds_exactly_once() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)]);
        let (mut pipeline, events) =
            FacePipeline::new(quick_config(), engines(&engine), alice()).unwrap();

        let next = feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });
        for index in next..next + 10 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
        }

        let events = drain(&events);
        let matched: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::IdentityMatched {
                    face_id,
                    identity,
                    entry,
                    ..
                } => Some((*face_id, identity.name.clone(), entry.message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(matched, vec![(1, "alice".to_string(), Some("alice".to_string()))]);
        assert_eq!(engine.calls().extract, 1);
        assert_eq!(engine.purposes(), vec![ExtractPurpose::Recognize]);
        assert_eq!(pipeline.entry(1).unwrap().message.as_deref(), Some("alice"));
    }

    #[test]
    fn test_extraction_budget_exhaustion_fails_then_retries() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_extract_outcomes(1, vec![Err(9); 4]);
        let config = RecognitionConfig {
            extract_feature_retry_count: 3,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });

        let events = drain(&events);
        let extract_errors = error_stages(&events)
            .into_iter()
            .filter(|s| *s == ErrorStage::ExtractFeature)
            .count();
        assert_eq!(extract_errors, 4);
        assert_eq!(engine.calls().extract, 5);

        let failed: Vec<_> = annotated_entries(&events, 1)
            .into_iter()
            .filter(|e| e.recognize_status == RecognizeStatus::Failed)
            .collect();
        assert!(!failed.is_empty());
        assert!(failed.iter().all(|e| e.extract_retry_count == 0));
        assert!(failed
            .iter()
            .all(|e| e.message.as_deref() == Some("ExtractFailed:9")));
    }

    #[test]
    fn test_full_feature_queue_marks_face_without_blocking() {
        let faces = [face(1, 0), face(2, 220), face(3, 440)];
        let engine = script_frames(ScriptedEngine::new(), 0..1, &faces)
            .with_extract_delay(Duration::from_millis(300));
        let config = RecognitionConfig {
            keep_max_face: false,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        let start = Instant::now();
        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));

        let third = pipeline.entry(3).unwrap();
        assert_eq!(third.message.as_deref(), Some("FeatureThread is full."));
        assert_eq!(third.recognize_status, RecognizeStatus::ToRetry);
        assert!(error_stages(&drain(&events)).is_empty());
    }

    #[test]
    fn test_departed_face_releases_blocked_feature_worker() {
        let undetermined = std::iter::repeat(Ok(LivenessVerdict::Undetermined(0))).take(10_000);
        let engine = script_frames(ScriptedEngine::new(), 0..3, &[face(1, 200)])
            .with_liveness_outcomes(1, undetermined);
        let engine = script_frames(engine, 3..2000, &[face(2, 200)]);
        let config = RecognitionConfig {
            liveness_type: LivenessType::Rgb,
            ..quick_config()
        };
        let gallery = gallery_of(&[(8, "bob", vec![1.0, 2.0])]);
        let (mut pipeline, _events) = FacePipeline::new(config, engines(&engine), gallery).unwrap();

        for index in 0..3 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(status_of(&pipeline, 1), Some(RecognizeStatus::Searching));

        // The single feature worker must be free again for face 2.
        feed_until(&mut pipeline, 3, |p| {
            status_of(p, 2) == Some(RecognizeStatus::Succeeded)
        });
        assert!(pipeline.entry(1).is_none());

        let start = Instant::now();
        pipeline.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_liveness_gates_recognition() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)]);
        let config = RecognitionConfig {
            liveness_type: LivenessType::Rgb,
            rgb_liveness_threshold: 0.55,
            ..quick_config()
        };
        let (mut pipeline, _events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });
        let entry = pipeline.entry(1).unwrap();
        assert_eq!(entry.liveness, LivenessState::Alive);
        assert!(engine.calls().liveness >= 1);
        assert_eq!(engine.thresholds().map(|t| t.rgb), Some(0.55));
    }

    #[test]
    fn test_not_alive_resets_and_eventually_succeeds() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_liveness_outcomes(1, [Ok(LivenessVerdict::NotAlive)]);
        let config = RecognitionConfig {
            liveness_type: LivenessType::Rgb,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });

        let history = annotated_entries(&drain(&events), 1);
        assert!(history.iter().any(|e| e.liveness == LivenessState::NotAlive
            && e.message.as_deref() == Some("NOT_ALIVE")));
        assert!(engine.calls().liveness >= 2);
    }

    #[test]
    fn test_ir_liveness_without_ir_frame_counts_as_engine_failure() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)]);
        let config = RecognitionConfig {
            liveness_type: LivenessType::Ir,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        let next = feed_until(&mut pipeline, 0, |p| {
            p.entry(1)
                .and_then(|e| e.message)
                .is_some_and(|m| m.starts_with("ProcessFailed:"))
        });
        assert_eq!(engine.calls().liveness, 0);
        let events = drain(&events);
        assert!(error_stages(&events).contains(&ErrorStage::DetectLiveness));

        pipeline.refresh_ir_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0));
        feed_until(&mut pipeline, next, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });
        assert!(engine.calls().liveness >= 1);
    }

    /// Retry intervals long enough that a failed entry stays failed for the
    /// rest of the test.
    fn sticky_config() -> RecognitionConfig {
        RecognitionConfig {
            recognize_failed_retry_interval_ms: 60_000,
            liveness_failed_retry_interval_ms: 60_000,
            ..Default::default()
        }
    }

    fn error_count(events: &[PipelineEvent], stage: ErrorStage) -> usize {
        error_stages(events).into_iter().filter(|s| *s == stage).count()
    }

    #[test]
    fn test_exhausted_liveness_fails_recognition_without_compare() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_liveness_outcomes(1, [Err(6), Err(6)]);
        let config = RecognitionConfig {
            liveness_type: LivenessType::Rgb,
            liveness_retry_count: 1,
            ..sticky_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Failed)
        });

        let entry = pipeline.entry(1).unwrap();
        assert_eq!(entry.liveness, LivenessState::Failed);
        assert_eq!(engine.calls().liveness, 2);
        assert_eq!(engine.calls().compare, 0);
        let events = drain(&events);
        assert_eq!(error_count(&events, ErrorStage::DetectLiveness), 2);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::IdentityMatched { .. })));
    }

    #[test]
    fn test_low_quality_counts_against_extract_budget() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_quality(1, 0.1);
        let config = RecognitionConfig {
            enable_image_quality: true,
            extract_feature_retry_count: 3,
            ..sticky_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Failed)
        });

        let entry = pipeline.entry(1).unwrap();
        assert_eq!(entry.message.as_deref(), Some("ImageQuality too low"));
        assert_eq!(engine.calls().quality, 4);
        assert_eq!(engine.calls().extract, 0);
        assert_eq!(error_count(&drain(&events), ErrorStage::ImageQuality), 4);
    }

    #[test]
    fn test_worn_mask_uses_masked_quality_threshold() {
        // 0.35 is below the no-mask threshold but above the masked one.
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_mask(1, MaskState::Worn)
            .with_quality(1, 0.35);
        let config = RecognitionConfig {
            enable_image_quality: true,
            enable_mask: true,
            ..sticky_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });

        assert_eq!(engine.calls().extract, 1);
        assert_eq!(error_count(&drain(&events), ErrorStage::ImageQuality), 0);
        assert_eq!(pipeline.entry(1).unwrap().mask, MaskState::Worn);
    }

    #[test]
    fn test_failed_mask_detection_keeps_face_out_of_workers() {
        let engine = (0..10).fold(
            script_frames(ScriptedEngine::new(), 0..10, &[face(1, 200)]),
            |engine, index| engine.with_mask_failure(index, 13),
        );
        let config = RecognitionConfig {
            enable_mask: true,
            liveness_type: LivenessType::Rgb,
            ..sticky_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        for index in 0..10 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
        }
        thread::sleep(Duration::from_millis(50));

        let calls = engine.calls();
        assert_eq!(calls.mask, 10);
        assert_eq!(calls.liveness, 0);
        assert_eq!(calls.quality, 0);
        assert_eq!(calls.extract, 0);
        assert_eq!(error_count(&drain(&events), ErrorStage::DetectMask), 10);
        assert_ne!(status_of(&pipeline, 1), Some(RecognizeStatus::Searching));
    }

    #[test]
    fn test_orientation_pushed_to_every_handle() {
        let engine = ScriptedEngine::new();
        let config = RecognitionConfig {
            detect_orientation: Orientation::AllOut,
            ..quick_config()
        };
        let (_pipeline, _events) = FacePipeline::new(config, engines(&engine), alice()).unwrap();

        assert_eq!(
            engine.orientations(),
            vec![
                ("detection", Orientation::AllOut),
                ("liveness", Orientation::Deg0),
                ("feature", Orientation::Deg0),
            ]
        );
    }

    #[test]
    fn test_paused_pipeline_skips_detection() {
        let engine = script_frames(ScriptedEngine::new(), 0..3, &[face(1, 200)]);
        let (mut pipeline, events) =
            FacePipeline::new(quick_config(), engines(&engine), alice()).unwrap();

        pipeline.set_paused(true);
        assert!(pipeline.is_paused());
        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();
        assert_eq!(engine.calls().detect, 0);
        assert!(drain(&events).is_empty());

        pipeline.set_paused(false);
        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 1))
            .unwrap();
        assert_eq!(engine.calls().detect, 1);
    }

    #[test]
    fn test_detect_failure_emits_error_and_no_annotation() {
        let engine = ScriptedEngine::new().with_detect_failure(0, 90_127);
        let (mut pipeline, events) =
            FacePipeline::new(quick_config(), engines(&engine), alice()).unwrap();

        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();

        let events = drain(&events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Error { stage, code, .. } => {
                assert_eq!(*stage, ErrorStage::DetectFaces);
                assert_eq!(*code, 90_127);
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }

    #[test]
    fn test_stable_detection_after_five_identical_frames() {
        let engine = script_frames(ScriptedEngine::new(), 0..7, &[face(1, 200)]);
        let config = RecognitionConfig {
            enable_recognize: false,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), None).unwrap();

        for index in 0..7 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
        }

        let stable: Vec<_> = drain(&events)
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::StableDetection { face_id, frame, .. } => {
                    Some((face_id, frame.index()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(stable, vec![(1, 0)]);
        assert_eq!(engine.calls().extract, 0);
    }

    #[test]
    fn test_population_count_and_area_events() {
        let engine = ScriptedEngine::new()
            .with_detections(0, vec![face(1, 200)])
            .with_detections(1, vec![face(1, 200), face(2, 0)])
            .with_detections(2, vec![]);
        let config = RecognitionConfig {
            enable_recognize: false,
            keep_max_face: false,
            max_faces: 2,
            enable_area_limit: true,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), None).unwrap();

        for index in 0..3 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
        }

        let kinds: Vec<_> = drain(&events)
            .into_iter()
            .filter(|e| !matches!(e, PipelineEvent::FrameAnnotated { .. }))
            .map(|e| match e {
                PipelineEvent::OutsideRecognitionArea { face_id } => format!("outside:{face_id}"),
                PipelineEvent::PopulationChanged { present } => format!("present:{present}"),
                PipelineEvent::FaceCountChanged { count, .. } => format!("count:{count}"),
                other => other.kind().to_string(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "present:true",
                "count:1",
                "count:2",
                "outside:2",
                "present:false",
                "count:0",
            ]
        );
        assert_eq!(pipeline.tracked_faces(), 0);
    }

    #[test]
    fn test_registration_mode_reports_feature() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)]);
        let config = RecognitionConfig {
            enable_compare: false,
            ..quick_config()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), None).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Succeeded)
        });

        let extracted = drain(&events)
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::FeatureExtracted { face_id: 1, .. }))
            .count();
        assert_eq!(extracted, 1);
        assert_eq!(pipeline.entry(1).unwrap().message.as_deref(), Some("Visitor,1"));
        assert_eq!(engine.purposes(), vec![ExtractPurpose::Register]);
        assert_eq!(engine.calls().compare, 0);
    }

    #[test]
    fn test_below_threshold_is_not_registered() {
        let engine = script_frames(ScriptedEngine::new(), 0..2000, &[face(1, 200)])
            .with_feature(1, vec![1.0, 0.0]);
        let gallery = gallery_of(&[(3, "carol", vec![0.0, 1.0])]);
        let config = RecognitionConfig {
            recognize_failed_retry_interval_ms: 5000,
            ..Default::default()
        };
        let (mut pipeline, events) = FacePipeline::new(config, engines(&engine), gallery).unwrap();

        feed_until(&mut pipeline, 0, |p| {
            status_of(p, 1) == Some(RecognizeStatus::Failed)
        });
        assert_eq!(
            pipeline.entry(1).unwrap().message.as_deref(),
            Some("Not Pass: NOT_REGISTERED")
        );
        assert!(!drain(&events)
            .iter()
            .any(|e| matches!(e, PipelineEvent::IdentityMatched { .. })));
    }

    #[test]
    fn test_missing_gallery_disables_recognition() {
        let engine = script_frames(ScriptedEngine::new(), 0..3, &[face(1, 200)]);
        let (mut pipeline, _events) =
            FacePipeline::new(quick_config(), engines(&engine), None).unwrap();
        assert!(!pipeline.config().enable_recognize);

        for index in 0..3 {
            pipeline
                .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, index))
                .unwrap();
        }
        assert_eq!(engine.calls().extract, 0);
        assert_eq!(status_of(&pipeline, 1), Some(RecognizeStatus::ToRetry));
    }

    #[test]
    fn test_registry_tracks_current_observations() {
        let engine = ScriptedEngine::new()
            .with_detections(0, vec![face(1, 0), face(2, 220), face(3, 440)])
            .with_detections(1, vec![face(2, 220)]);
        let config = RecognitionConfig {
            enable_recognize: false,
            keep_max_face: false,
            max_faces: 3,
            ..quick_config()
        };
        let (mut pipeline, _events) = FacePipeline::new(config, engines(&engine), None).unwrap();

        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();
        assert_eq!(pipeline.tracked_faces(), 3);
        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 1))
            .unwrap();
        assert_eq!(pipeline.tracked_faces(), 1);
        assert_eq!(
            pipeline.entries().iter().map(|e| e.face_id).collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn test_keep_max_face_tracks_only_largest() {
        let small = DetectedFace {
            face_id: 4,
            rect: FaceRect::new(0, 0, 170, 170),
        };
        let engine = ScriptedEngine::new().with_detections(0, vec![small, face(5, 300)]);
        let config = RecognitionConfig {
            enable_recognize: false,
            ..quick_config()
        };
        let (mut pipeline, _events) = FacePipeline::new(config, engines(&engine), None).unwrap();

        pipeline
            .process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();
        assert_eq!(
            pipeline.entries().iter().map(|e| e.face_id).collect::<Vec<_>>(),
            vec![5]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let engine = ScriptedEngine::new();
        let config = RecognitionConfig {
            max_faces: 0,
            ..Default::default()
        };
        let err = FacePipeline::new(config, engines(&engine), alice()).err().unwrap();
        assert!(matches!(err, PipelineError::Config(ConfigError::MaxFaces(0))));
    }

    #[test]
    fn test_shutdown_releases_engines_and_rejects_frames() {
        let engine = ScriptedEngine::new();
        let (pipeline, _events) =
            FacePipeline::new(quick_config(), engines(&engine), alice()).unwrap();
        let mut pipeline = pipeline.with_logger(Box::new(LogPipelineLogger::new(10)));

        pipeline.shutdown();
        pipeline.shutdown();

        assert_eq!(engine.calls().released, 3);
        assert!(matches!(
            pipeline.process_frame(Frame::blank_nv21(WIDTH, HEIGHT, 0)),
            Err(PipelineError::ShutDown)
        ));
    }

    #[test]
    fn test_compare_and_enroll_share_engine() {
        let engine = ScriptedEngine::new()
            .with_detections(0, vec![face(6, 200)])
            .with_feature(6, vec![3.0, 4.0]);
        let (pipeline, _events) =
            FacePipeline::new(quick_config(), engines(&engine), alice()).unwrap();

        let feature = pipeline
            .enroller()
            .extract_enrollment_feature(&Frame::blank_nv21(WIDTH, HEIGHT, 0))
            .unwrap();
        assert_eq!(feature, encode_feature(&[3.0, 4.0]));
        let similarity = pipeline
            .compare_features(&feature, &encode_feature(&[6.0, 8.0]))
            .unwrap();
        assert!((similarity - 1.0).abs() < 1e-6);
    }
}
