use std::sync::Arc;

use thiserror::Error;

use crate::engine::domain::engine_error::EngineError;
use crate::engine::domain::engine_handle::EngineHandle;
use crate::engine::domain::face_engine::{
    DetectionEngine, ExtractPurpose, FaceFeature, FeatureEngine,
};
use crate::shared::frame::Frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("face detection failed: {0}")]
    Detect(#[source] EngineError),
    #[error("no face found in enrollment image")]
    NoFace,
    #[error("mask detection failed: {0}")]
    Mask(#[source] EngineError),
    #[error("mask detection returned {masks} results for {faces} faces")]
    MaskCountMismatch { masks: usize, faces: usize },
    #[error("feature extraction failed: {0}")]
    Extract(#[source] EngineError),
}

/// Produces registration-grade features for new identities.
pub struct Enroller {
    detection: Arc<EngineHandle<dyn DetectionEngine>>,
    feature: Arc<EngineHandle<dyn FeatureEngine>>,
}

impl Enroller {
    pub fn new(
        detection: Arc<EngineHandle<dyn DetectionEngine>>,
        feature: Arc<EngineHandle<dyn FeatureEngine>>,
    ) -> Self {
        Self { detection, feature }
    }

    /// Detects faces in `frame` and extracts a register-purpose feature for
    /// the first one.
    pub fn extract_enrollment_feature(&self, frame: &Frame) -> Result<FaceFeature, EnrollError> {
        let (face, mask) = self.detection.call(|e| -> Result<_, EnrollError> {
            let faces = e.detect(frame).map_err(EnrollError::Detect)?;
            let first = *faces.first().ok_or(EnrollError::NoFace)?;
            let masks = e.detect_mask(frame, &faces).map_err(EnrollError::Mask)?;
            if masks.len() != faces.len() {
                return Err(EnrollError::MaskCountMismatch {
                    masks: masks.len(),
                    faces: faces.len(),
                });
            }
            Ok((first, masks[0]))
        })?;

        self.feature
            .call(|e| e.extract_feature(frame, &face, mask, ExtractPurpose::Register))
            .map_err(|err| {
                log::error!("enrollment extraction failed: {err}");
                EnrollError::Extract(err)
            })
    }
}
