use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::engine::domain::engine_error::{EngineError, EngineResult};
use crate::engine::domain::face_engine::{
    DetectedFace, DetectionEngine, ExtractPurpose, FaceFeature, FaceId, FeatureEngine,
    LivenessEngine, LivenessThresholds, LivenessVerdict, MaskState,
};
use crate::shared::config::Orientation;
use crate::shared::frame::Frame;

/// Engine code returned when two features of different length are compared.
pub const CODE_INVALID_PARAM: i32 = 2;

/// Number of calls made into each engine operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub detect: usize,
    pub mask: usize,
    pub liveness: usize,
    pub quality: usize,
    pub extract: usize,
    pub compare: usize,
    pub released: usize,
}

#[derive(Default)]
struct Script {
    detections: HashMap<usize, Vec<DetectedFace>>,
    detect_failures: HashMap<usize, i32>,
    mask_failures: HashMap<usize, i32>,
    masks: HashMap<FaceId, MaskState>,
    liveness: HashMap<FaceId, VecDeque<Result<LivenessVerdict, i32>>>,
    extractions: HashMap<FaceId, VecDeque<Result<Vec<f32>, i32>>>,
    features: HashMap<FaceId, Vec<f32>>,
    qualities: HashMap<FaceId, f32>,
    liveness_delay: Option<Duration>,
    extract_delay: Option<Duration>,
    thresholds: Option<LivenessThresholds>,
    orientations: Vec<(&'static str, Orientation)>,
    purposes: Vec<ExtractPurpose>,
    calls: CallCounts,
}

/// Replays scripted engine results keyed by frame index and face id.
///
/// Detections are looked up by `Frame::index`, like a cached detector
/// replaying a previous detection pass. Liveness and extraction outcomes
/// are queued per face and consumed one per call; once a queue is empty
/// the face falls back to its steady-state result (alive, and its
/// registered feature).
///
/// Clones share one script, so a single instance can back all three
/// sub-handles and tests can inspect call counts afterwards.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(self, frame_index: usize, faces: Vec<DetectedFace>) -> Self {
        self.script().detections.insert(frame_index, faces);
        self
    }

    pub fn with_detect_failure(self, frame_index: usize, code: i32) -> Self {
        self.script().detect_failures.insert(frame_index, code);
        self
    }

    pub fn with_mask_failure(self, frame_index: usize, code: i32) -> Self {
        self.script().mask_failures.insert(frame_index, code);
        self
    }

    pub fn with_mask(self, face_id: FaceId, mask: MaskState) -> Self {
        self.script().masks.insert(face_id, mask);
        self
    }

    /// Steady-state feature for a face.
    pub fn with_feature(self, face_id: FaceId, values: Vec<f32>) -> Self {
        self.script().features.insert(face_id, values);
        self
    }

    pub fn with_quality(self, face_id: FaceId, score: f32) -> Self {
        self.script().qualities.insert(face_id, score);
        self
    }

    /// Queues liveness outcomes; `Err` carries an engine failure code.
    pub fn with_liveness_outcomes(
        self,
        face_id: FaceId,
        outcomes: impl IntoIterator<Item = Result<LivenessVerdict, i32>>,
    ) -> Self {
        self.script()
            .liveness
            .entry(face_id)
            .or_default()
            .extend(outcomes);
        self
    }

    /// Queues extraction outcomes ahead of the steady-state feature.
    pub fn with_extract_outcomes(
        self,
        face_id: FaceId,
        outcomes: impl IntoIterator<Item = Result<Vec<f32>, i32>>,
    ) -> Self {
        self.script()
            .extractions
            .entry(face_id)
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn with_liveness_delay(self, delay: Duration) -> Self {
        self.script().liveness_delay = Some(delay);
        self
    }

    pub fn with_extract_delay(self, delay: Duration) -> Self {
        self.script().extract_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.script().calls
    }

    pub fn thresholds(&self) -> Option<LivenessThresholds> {
        self.script().thresholds
    }

    /// Orientations pushed to each sub-handle, in call order.
    pub fn orientations(&self) -> Vec<(&'static str, Orientation)> {
        self.script().orientations.clone()
    }

    /// Purposes passed to `extract_feature`, in call order.
    pub fn purposes(&self) -> Vec<ExtractPurpose> {
        self.script().purposes.clone()
    }

    fn record_orientation(&self, handle: &'static str, orientation: Orientation) -> EngineResult<()> {
        self.script().orientations.push((handle, orientation));
        Ok(())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_liveness(&self, face_id: FaceId) -> EngineResult<LivenessVerdict> {
        let delay = {
            let mut script = self.script();
            script.calls.liveness += 1;
            script.liveness_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let outcome = self
            .script()
            .liveness
            .get_mut(&face_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(LivenessVerdict::Alive));
        outcome.map_err(EngineError::new)
    }
}

impl DetectionEngine for ScriptedEngine {
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()> {
        self.record_orientation("detection", orientation)
    }

    fn detect(&mut self, frame: &Frame) -> EngineResult<Vec<DetectedFace>> {
        let mut script = self.script();
        script.calls.detect += 1;
        if let Some(&code) = script.detect_failures.get(&frame.index()) {
            return Err(EngineError::new(code));
        }
        Ok(script
            .detections
            .get(&frame.index())
            .cloned()
            .unwrap_or_default())
    }

    fn detect_mask(
        &mut self,
        frame: &Frame,
        faces: &[DetectedFace],
    ) -> EngineResult<Vec<MaskState>> {
        let mut script = self.script();
        script.calls.mask += 1;
        if let Some(&code) = script.mask_failures.get(&frame.index()) {
            return Err(EngineError::new(code));
        }
        Ok(faces
            .iter()
            .map(|f| script.masks.get(&f.face_id).copied().unwrap_or(MaskState::NoMask))
            .collect())
    }

    fn release(&mut self) {
        self.script().calls.released += 1;
    }
}

impl LivenessEngine for ScriptedEngine {
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()> {
        self.record_orientation("liveness", orientation)
    }

    fn set_thresholds(&mut self, thresholds: LivenessThresholds) -> EngineResult<()> {
        self.script().thresholds = Some(thresholds);
        Ok(())
    }

    fn process_rgb_liveness(
        &mut self,
        _frame: &Frame,
        face: &DetectedFace,
    ) -> EngineResult<LivenessVerdict> {
        self.next_liveness(face.face_id)
    }

    fn process_ir_liveness(
        &mut self,
        _ir_frame: &Frame,
        face: &DetectedFace,
    ) -> EngineResult<LivenessVerdict> {
        self.next_liveness(face.face_id)
    }

    fn release(&mut self) {
        self.script().calls.released += 1;
    }
}

impl FeatureEngine for ScriptedEngine {
    fn set_orientation(&mut self, orientation: Orientation) -> EngineResult<()> {
        self.record_orientation("feature", orientation)
    }

    fn image_quality(
        &mut self,
        _frame: &Frame,
        face: &DetectedFace,
        _mask: MaskState,
    ) -> EngineResult<f32> {
        let mut script = self.script();
        script.calls.quality += 1;
        Ok(script.qualities.get(&face.face_id).copied().unwrap_or(1.0))
    }

    fn extract_feature(
        &mut self,
        _frame: &Frame,
        face: &DetectedFace,
        _mask: MaskState,
        purpose: ExtractPurpose,
    ) -> EngineResult<FaceFeature> {
        let delay = {
            let mut script = self.script();
            script.calls.extract += 1;
            script.purposes.push(purpose);
            script.extract_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut script = self.script();
        let queued = script
            .extractions
            .get_mut(&face.face_id)
            .and_then(VecDeque::pop_front);
        let values = match queued {
            Some(outcome) => outcome.map_err(EngineError::new)?,
            None => script
                .features
                .get(&face.face_id)
                .cloned()
                .unwrap_or_else(|| vec![1.0, face.face_id as f32]),
        };
        Ok(encode_feature(&values))
    }

    fn compare(&mut self, a: &FaceFeature, b: &FaceFeature) -> EngineResult<f32> {
        self.script().calls.compare += 1;
        let a = decode_feature(a);
        let b = decode_feature(b);
        if a.len() != b.len() || a.is_empty() {
            return Err(EngineError::new(CODE_INVALID_PARAM));
        }
        Ok(cosine_similarity(&a, &b))
    }

    fn release(&mut self) {
        self.script().calls.released += 1;
    }
}

/// Packs float components little-endian, the layout `compare` expects.
pub fn encode_feature(values: &[f32]) -> FaceFeature {
    FaceFeature(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

pub fn decode_feature(feature: &FaceFeature) -> Vec<f32> {
    feature
        .as_bytes()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::face_rect::FaceRect;
    use approx::assert_relative_eq;

    fn face(face_id: FaceId) -> DetectedFace {
        DetectedFace {
            face_id,
            rect: FaceRect::new(0, 0, 200, 200),
        }
    }

    #[test]
    fn test_replays_detections_by_frame_index() {
        let mut engine = ScriptedEngine::new()
            .with_detections(0, vec![face(1)])
            .with_detections(1, vec![face(1), face(2)]);

        assert_eq!(engine.detect(&Frame::blank_nv21(4, 4, 0)).unwrap().len(), 1);
        assert_eq!(engine.detect(&Frame::blank_nv21(4, 4, 1)).unwrap().len(), 2);
        assert!(engine.detect(&Frame::blank_nv21(4, 4, 9)).unwrap().is_empty());
        assert_eq!(engine.calls().detect, 3);
    }

    #[test]
    fn test_detect_failure_returns_code() {
        let mut engine = ScriptedEngine::new().with_detect_failure(3, 7);
        let err = engine.detect(&Frame::blank_nv21(4, 4, 3)).unwrap_err();
        assert_eq!(err.code, 7);
    }

    #[test]
    fn test_mask_defaults_to_no_mask() {
        let mut engine = ScriptedEngine::new().with_mask(2, MaskState::Worn);
        let masks = engine
            .detect_mask(&Frame::blank_nv21(4, 4, 0), &[face(1), face(2)])
            .unwrap();
        assert_eq!(masks, vec![MaskState::NoMask, MaskState::Worn]);
    }

    #[test]
    fn test_mask_failure_is_per_frame() {
        let mut engine = ScriptedEngine::new().with_mask_failure(2, 11);
        let err = engine
            .detect_mask(&Frame::blank_nv21(4, 4, 2), &[face(1)])
            .unwrap_err();
        assert_eq!(err.code, 11);
        assert!(engine.detect_mask(&Frame::blank_nv21(4, 4, 3), &[face(1)]).is_ok());
        assert_eq!(engine.calls().mask, 2);
    }

    #[test]
    fn test_liveness_queue_then_alive() {
        let mut engine = ScriptedEngine::new()
            .with_liveness_outcomes(1, [Err(5), Ok(LivenessVerdict::NotAlive)]);
        let frame = Frame::blank_nv21(4, 4, 0);

        assert_eq!(engine.process_rgb_liveness(&frame, &face(1)).unwrap_err().code, 5);
        assert_eq!(
            engine.process_ir_liveness(&frame, &face(1)).unwrap(),
            LivenessVerdict::NotAlive
        );
        assert_eq!(
            engine.process_rgb_liveness(&frame, &face(1)).unwrap(),
            LivenessVerdict::Alive
        );
        assert_eq!(engine.calls().liveness, 3);
    }

    #[test]
    fn test_extract_queue_then_registered_feature() {
        let mut engine = ScriptedEngine::new()
            .with_feature(4, vec![0.5, 0.5])
            .with_extract_outcomes(4, [Err(9)]);
        let frame = Frame::blank_nv21(4, 4, 0);

        let first = engine.extract_feature(&frame, &face(4), MaskState::NoMask, ExtractPurpose::Recognize);
        assert_eq!(first.unwrap_err().code, 9);
        let second = engine
            .extract_feature(&frame, &face(4), MaskState::NoMask, ExtractPurpose::Register)
            .unwrap();
        assert_eq!(decode_feature(&second), vec![0.5, 0.5]);
        assert_eq!(
            engine.purposes(),
            vec![ExtractPurpose::Recognize, ExtractPurpose::Register]
        );
    }

    #[test]
    fn test_compare_is_cosine_similarity() {
        let mut engine = ScriptedEngine::new();
        let a = encode_feature(&[1.0, 0.0]);
        let b = encode_feature(&[1.0, 1.0]);

        assert_relative_eq!(engine.compare(&a, &a).unwrap(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(
            engine.compare(&a, &b).unwrap(),
            std::f32::consts::FRAC_1_SQRT_2,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_compare_rejects_mismatched_lengths() {
        let mut engine = ScriptedEngine::new();
        let err = engine
            .compare(&encode_feature(&[1.0]), &encode_feature(&[1.0, 2.0]))
            .unwrap_err();
        assert_eq!(err.code, CODE_INVALID_PARAM);
    }

    #[test]
    fn test_clones_share_script() {
        let engine = ScriptedEngine::new();
        let mut liveness = engine.clone();
        let thresholds = LivenessThresholds {
            rgb: 0.6,
            ir: 0.7,
            face_quality: 0.6,
        };
        liveness.set_thresholds(thresholds).unwrap();
        LivenessEngine::release(&mut liveness);

        assert_eq!(engine.thresholds(), Some(thresholds));
        assert_eq!(engine.calls().released, 1);
    }
}
