use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use super::pipeline_event::{ErrorStage, PipelineEvent};
use crate::engine::domain::engine_error::{EngineError, EngineResult};
use crate::engine::domain::engine_handle::EngineHandle;
use crate::engine::domain::face_engine::{
    ExtractPurpose, FaceFeature, FeatureEngine, LivenessEngine, LivenessVerdict, MaskState,
};
use crate::recognition::domain::identity_gallery::IdentityGallery;
use crate::recognition::domain::matching_service::{MatchError, MatchingService};
use crate::recognition::domain::recognition_registry::RecognitionRegistry;
use crate::recognition::domain::recognize_entry::{LivenessState, RecognizeEntry, WaitOutcome};
use crate::recognition::infrastructure::retry_scheduler::{ResetAction, ResetTask, RetryScheduler};
use crate::shared::config::{LivenessType, RecognitionConfig};
use crate::shared::frame::Frame;
use crate::tracking::domain::face_tracker::FaceObservation;

/// Code reported when IR liveness runs before any IR frame arrived.
pub const MISSING_IR_FRAME_CODE: i32 = 5;

/// Shared state the liveness and feature tasks run against.
pub struct StageContext {
    pub config: Arc<RecognitionConfig>,
    pub registry: Arc<RecognitionRegistry>,
    pub scheduler: Arc<RetryScheduler>,
    pub liveness_engine: Arc<EngineHandle<dyn LivenessEngine>>,
    pub feature_engine: Arc<EngineHandle<dyn FeatureEngine>>,
    pub matcher: MatchingService,
    pub gallery: Option<Arc<dyn IdentityGallery>>,
    pub events: Sender<PipelineEvent>,
    pub cancelled: Arc<AtomicBool>,
}

impl StageContext {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// False once the pipeline is stopping or the face has left.
    fn still_tracked(&self, entry: &Arc<RecognizeEntry>) -> bool {
        if self.cancelled() {
            return false;
        }
        if !self.registry.is_current(entry) {
            log::warn!("face {} already left, dropping result", entry.face_id());
            return false;
        }
        true
    }

    fn schedule_reset(&self, entry: &RecognizeEntry, action: ResetAction) {
        let delay = match action {
            ResetAction::Recognize => self.config.recognize_retry_interval(),
            ResetAction::Liveness => self.config.liveness_retry_interval(),
        };
        self.scheduler.schedule(
            ResetTask {
                face_id: entry.face_id(),
                epoch: entry.epoch(),
                action,
            },
            delay,
        );
    }

    fn report_error(&self, stage: ErrorStage, code: i32, message: impl Into<String>) {
        let message = message.into();
        log::error!("{stage} failed with code {code}: {message}");
        let _ = self.events.send(PipelineEvent::Error {
            stage,
            code,
            message,
        });
    }

    fn report_engine_error(&self, stage: ErrorStage, err: EngineError) {
        self.report_error(stage, err.code, err.describe());
    }
}

/// Applies a fired delayed reset if its entry is still the live one.
pub fn apply_reset(registry: &RecognitionRegistry, task: ResetTask) {
    let Some(entry) = registry.get(task.face_id) else {
        return;
    };
    if entry.epoch() != task.epoch {
        return;
    }
    match task.action {
        ResetAction::Recognize => entry.reset_recognize(),
        ResetAction::Liveness => entry.reset_liveness(),
    };
}

/// Liveness task body. The entry is already `Analyzing`.
pub fn run_liveness(
    ctx: &StageContext,
    entry: Arc<RecognizeEntry>,
    observation: FaceObservation,
    frame: Arc<Frame>,
    ir_frame: Option<Arc<Frame>>,
) {
    if !ctx.still_tracked(&entry) {
        return;
    }

    let start = Instant::now();
    let outcome: EngineResult<LivenessVerdict> = match ctx.config.liveness_type {
        LivenessType::Ir => match ir_frame {
            Some(ir) => ctx
                .liveness_engine
                .call(|e| e.process_ir_liveness(&ir, &observation.detected_ir())),
            None => Err(EngineError::new(MISSING_IR_FRAME_CODE)),
        },
        _ => ctx
            .liveness_engine
            .call(|e| e.process_rgb_liveness(&frame, &observation.detected())),
    };
    log_stage("liveness", entry.face_id(), start.elapsed());

    if !ctx.still_tracked(&entry) {
        return;
    }

    match outcome {
        Ok(LivenessVerdict::Alive) => {
            entry.resolve_liveness(LivenessVerdict::Alive);
        }
        Ok(LivenessVerdict::NotAlive) => {
            if entry.resolve_liveness(LivenessVerdict::NotAlive) {
                entry.set_message("NOT_ALIVE");
                ctx.schedule_reset(&entry, ResetAction::Liveness);
            }
        }
        Ok(verdict @ LivenessVerdict::Undetermined(value)) => {
            log::warn!("face {} liveness undetermined ({value})", entry.face_id());
            entry.resolve_liveness(verdict);
            entry.set_message(format!("LIVENESS FAILED:{value}"));
        }
        Err(err) => {
            entry.set_message(format!("ProcessFailed:{}", err.code));
            ctx.report_engine_error(ErrorStage::DetectLiveness, err);
            if entry.liveness_engine_failed(ctx.config.liveness_retry_count) {
                ctx.schedule_reset(&entry, ResetAction::Liveness);
            }
        }
    }
}

/// Feature task body. The entry is already `Searching`.
pub fn run_feature(
    ctx: &StageContext,
    entry: Arc<RecognizeEntry>,
    observation: FaceObservation,
    frame: Arc<Frame>,
) {
    if !ctx.still_tracked(&entry) {
        return;
    }
    let Some(feature) = extract(ctx, &entry, &observation, &frame) else {
        return;
    };
    if !ctx.still_tracked(&entry) {
        return;
    }
    entry.set_mask(observation.mask);

    if !ctx.config.liveness_enabled() {
        search(ctx, &entry, feature, &frame);
        return;
    }

    let resolved = match entry.liveness() {
        state @ (LivenessState::Alive | LivenessState::Failed) => state,
        _ => match entry.wait_for_liveness(&ctx.cancelled) {
            WaitOutcome::Resolved(state) => state,
            WaitOutcome::Removed => {
                log::debug!("face {} left while awaiting liveness", entry.face_id());
                return;
            }
            WaitOutcome::Interrupted => return,
        },
    };
    if !ctx.still_tracked(&entry) {
        return;
    }

    if resolved == LivenessState::Alive {
        search(ctx, &entry, feature, &frame);
    } else if entry.fail_search() {
        ctx.schedule_reset(&entry, ResetAction::Recognize);
    }
}

/// Quality gate plus extraction. `None` means the attempt failed and has
/// been accounted for.
fn extract(
    ctx: &StageContext,
    entry: &Arc<RecognizeEntry>,
    observation: &FaceObservation,
    frame: &Frame,
) -> Option<FaceFeature> {
    let face = observation.detected();
    let mask = observation.mask;

    if ctx.config.enable_image_quality {
        let threshold = if mask == MaskState::Worn {
            ctx.config.image_quality_mask_threshold
        } else {
            ctx.config.image_quality_no_mask_threshold
        };
        match ctx.feature_engine.call(|e| e.image_quality(frame, &face, mask)) {
            Ok(score) if score >= threshold => {}
            Ok(score) => {
                log::debug!("face {} quality {score:.2} below {threshold:.2}", entry.face_id());
                if ctx.still_tracked(entry) {
                    entry.set_message("ImageQuality too low");
                    ctx.report_error(ErrorStage::ImageQuality, 0, "imageQuality score too low");
                    extraction_failed(ctx, entry);
                }
                return None;
            }
            Err(err) => {
                if ctx.still_tracked(entry) {
                    entry.set_message(format!("ImageDetectFailed:{}", err.code));
                    ctx.report_engine_error(ErrorStage::ImageQuality, err);
                    extraction_failed(ctx, entry);
                }
                return None;
            }
        }
    }

    let purpose = if ctx.config.enable_compare {
        ExtractPurpose::Recognize
    } else {
        ExtractPurpose::Register
    };
    let start = Instant::now();
    let result = ctx
        .feature_engine
        .call(|e| e.extract_feature(frame, &face, mask, purpose));
    log_stage("extract", entry.face_id(), start.elapsed());

    match result {
        Ok(feature) => Some(feature),
        Err(err) => {
            if ctx.still_tracked(entry) {
                entry.set_message(format!("ExtractFailed:{}", err.code));
                ctx.report_engine_error(ErrorStage::ExtractFeature, err);
                extraction_failed(ctx, entry);
            }
            None
        }
    }
}

fn extraction_failed(ctx: &StageContext, entry: &RecognizeEntry) {
    if entry.extract_failed(ctx.config.extract_feature_retry_count) {
        ctx.schedule_reset(entry, ResetAction::Recognize);
    }
}

fn search(ctx: &StageContext, entry: &Arc<RecognizeEntry>, feature: FaceFeature, frame: &Arc<Frame>) {
    let face_id = entry.face_id();
    let visitor = format!("Visitor,{face_id}");

    if !ctx.config.enable_compare {
        if entry.succeed(visitor) {
            let _ = ctx.events.send(PipelineEvent::FeatureExtracted {
                face_id,
                feature,
                entry: entry.snapshot(),
                frame: Arc::clone(frame),
            });
        }
        return;
    }

    let Some(gallery) = ctx.gallery.as_ref() else {
        if entry.fail_search() {
            entry.set_message(visitor);
        }
        return;
    };

    let start = Instant::now();
    let result = ctx.matcher.search(&feature, gallery.enrolled());
    log_stage("match", face_id, start.elapsed());
    if !ctx.still_tracked(entry) {
        return;
    }

    match result {
        Ok(best) if best.similarity >= gallery.similarity_threshold() => {
            if entry.succeed(best.identity.name.clone()) {
                log::info!(
                    "face {face_id} matched {} ({:.3})",
                    best.identity.name,
                    best.similarity
                );
                let _ = ctx.events.send(PipelineEvent::IdentityMatched {
                    face_id,
                    feature,
                    identity: best.identity,
                    similarity: best.similarity,
                    entry: entry.snapshot(),
                    frame: Arc::clone(frame),
                });
            }
        }
        Ok(best) => {
            log::debug!("face {face_id} best similarity {:.3} below threshold", best.similarity);
            if entry.fail_search() {
                entry.set_message("Not Pass: NOT_REGISTERED");
                ctx.schedule_reset(entry, ResetAction::Recognize);
            }
        }
        Err(err) => {
            match &err {
                MatchError::NoComparableEnrollment { last, .. } => {
                    ctx.report_engine_error(ErrorStage::CompareFeature, *last)
                }
                MatchError::Engine(last) => ctx.report_engine_error(ErrorStage::CompareFeature, *last),
                MatchError::EmptyGallery => log::warn!("face {face_id}: {err}"),
            }
            if entry.fail_search() {
                entry.set_message(visitor);
                ctx.schedule_reset(entry, ResetAction::Recognize);
            }
        }
    }
}

fn log_stage(stage: &str, face_id: i32, elapsed: Duration) {
    log::debug!(
        "face {face_id} {stage} took {:.1}ms",
        elapsed.as_secs_f64() * 1000.0
    );
}
