use serde::{Deserialize, Serialize};

use super::engine_error::EngineResult;
use crate::shared::config::Orientation;
use crate::shared::face_rect::FaceRect;
use crate::shared::frame::Frame;

/// Tracker-assigned face identifier, stable across consecutive frames.
pub type FaceId = i32;

/// One face reported by the detection sub-handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub face_id: FaceId,
    pub rect: FaceRect,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskState {
    #[default]
    Unknown,
    NoMask,
    Worn,
}

/// Outcome of a successful liveness call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessVerdict {
    Alive,
    NotAlive,
    /// The engine ran but could not decide (e.g. face too small, more than
    /// one face, angle too steep). Carries the engine's raw verdict value.
    Undetermined(i32),
}

/// What a feature is extracted for; registration features are stricter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractPurpose {
    Recognize,
    Register,
}

/// Opaque fixed-size face descriptor produced by the feature sub-handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceFeature(pub Vec<u8>);

impl FaceFeature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LivenessThresholds {
    pub rgb: f32,
    pub ir: f32,
    pub face_quality: f32,
}

/// Video-mode detection sub-handle: tracking and mask classification.
///
/// Not reentrant; callers reach it only through an `EngineHandle`.
pub trait DetectionEngine: Send {
    /// Orientation priority used when scanning frames. Video mode accepts
    /// `AllOut`.
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()>;

    fn detect(&mut self, frame: &Frame) -> EngineResult<Vec<DetectedFace>>;

    /// One mask state per input face, in input order.
    fn detect_mask(&mut self, frame: &Frame, faces: &[DetectedFace])
        -> EngineResult<Vec<MaskState>>;

    /// Releases engine resources. Default: no-op.
    fn release(&mut self) {}
}

/// Image-mode liveness sub-handle.
pub trait LivenessEngine: Send {
    /// Image-mode handles take a single orientation.
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()>;

    fn set_thresholds(&mut self, thresholds: LivenessThresholds) -> EngineResult<()>;

    fn process_rgb_liveness(
        &mut self,
        frame: &Frame,
        face: &DetectedFace,
    ) -> EngineResult<LivenessVerdict>;

    /// `face` carries IR-space geometry.
    fn process_ir_liveness(
        &mut self,
        ir_frame: &Frame,
        face: &DetectedFace,
    ) -> EngineResult<LivenessVerdict>;

    fn release(&mut self) {}
}

/// Image-mode recognition sub-handle: quality scoring, extraction, comparison.
pub trait FeatureEngine: Send {
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()>;

    fn image_quality(&mut self, frame: &Frame, face: &DetectedFace, mask: MaskState)
        -> EngineResult<f32>;

    fn extract_feature(
        &mut self,
        frame: &Frame,
        face: &DetectedFace,
        mask: MaskState,
        purpose: ExtractPurpose,
    ) -> EngineResult<FaceFeature>;

    /// Similarity of two features, higher is closer.
    fn compare(&mut self, a: &FaceFeature, b: &FaceFeature) -> EngineResult<f32>;

    fn release(&mut self) {}
}
