use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use facegate_core::engine::domain::face_engine::{DetectedFace, FaceId, LivenessVerdict, MaskState};
use facegate_core::engine::infrastructure::scripted_engine::{encode_feature, ScriptedEngine};
use facegate_core::recognition::domain::identity_gallery::{
    EnrolledFace, IdentityGallery, StaticGallery, DEFAULT_SIMILARITY_THRESHOLD,
};

/// A recorded session: per-frame detections plus the engine's scripted
/// answers for each face.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_frame_size")]
    pub frame_size: (u32, u32),
    /// Supply an IR frame alongside every visible frame.
    #[serde(default)]
    pub ir: bool,
    pub frames: Vec<ScenarioFrame>,
    #[serde(default)]
    pub masks: HashMap<FaceId, MaskState>,
    #[serde(default)]
    pub features: HashMap<FaceId, Vec<f32>>,
    #[serde(default)]
    pub qualities: HashMap<FaceId, f32>,
    #[serde(default)]
    pub liveness: HashMap<FaceId, Vec<LivenessStep>>,
    /// Engine codes returned by the first extraction attempts per face.
    #[serde(default)]
    pub extract_failures: HashMap<FaceId, Vec<i32>>,
    #[serde(default)]
    pub liveness_delay_ms: Option<u64>,
    #[serde(default)]
    pub extract_delay_ms: Option<u64>,
    #[serde(default)]
    pub gallery: Option<ScenarioGallery>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFrame {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
    /// Makes detection fail on this frame with the given engine code.
    #[serde(default)]
    pub detect_error: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStep {
    Verdict(LivenessVerdict),
    EngineError(i32),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioGallery {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    pub identities: Vec<ScenarioIdentity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioIdentity {
    pub id: u64,
    pub name: String,
    pub feature: Vec<f32>,
}

fn default_frame_size() -> (u32, u32) {
    (640, 480)
}

fn default_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read scenario {}: {e}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let scenario: Scenario = serde_json::from_str(json)?;
        if scenario.frames.is_empty() {
            return Err("Scenario has no frames".into());
        }
        let (width, height) = scenario.frame_size;
        if width == 0 || height == 0 {
            return Err(format!("Frame size must be non-zero, got {width}x{height}").into());
        }
        Ok(scenario)
    }

    /// Builds the replaying engine that answers for every sub-handle.
    pub fn engine(&self) -> ScriptedEngine {
        let mut engine = ScriptedEngine::new();
        for (index, frame) in self.frames.iter().enumerate() {
            engine = match frame.detect_error {
                Some(code) => engine.with_detect_failure(index, code),
                None => engine.with_detections(index, frame.faces.clone()),
            };
        }
        for (&face_id, &mask) in &self.masks {
            engine = engine.with_mask(face_id, mask);
        }
        for (&face_id, values) in &self.features {
            engine = engine.with_feature(face_id, values.clone());
        }
        for (&face_id, &score) in &self.qualities {
            engine = engine.with_quality(face_id, score);
        }
        for (&face_id, steps) in &self.liveness {
            engine = engine.with_liveness_outcomes(
                face_id,
                steps.iter().map(|step| match *step {
                    LivenessStep::Verdict(verdict) => Ok(verdict),
                    LivenessStep::EngineError(code) => Err(code),
                }),
            );
        }
        for (&face_id, codes) in &self.extract_failures {
            engine = engine.with_extract_outcomes(face_id, codes.iter().map(|&code| Err(code)));
        }
        if let Some(ms) = self.liveness_delay_ms {
            engine = engine.with_liveness_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.extract_delay_ms {
            engine = engine.with_extract_delay(Duration::from_millis(ms));
        }
        engine
    }

    pub fn gallery(&self) -> Option<Arc<dyn IdentityGallery>> {
        let gallery = self.gallery.as_ref()?;
        let faces = gallery
            .identities
            .iter()
            .map(|identity| EnrolledFace {
                id: identity.id,
                name: identity.name.clone(),
                feature: encode_feature(&identity.feature),
            })
            .collect();
        Some(Arc::new(StaticGallery::new(faces, gallery.threshold)))
    }
}
