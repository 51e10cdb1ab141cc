use std::sync::Arc;

use serde::Serialize;

use super::rect_transformer::RectTransformer;
use crate::engine::domain::face_engine::{DetectedFace, FaceId, MaskState};
use crate::shared::config::RecognitionConfig;
use crate::shared::face_rect::FaceRect;

/// One face in the current frame, with its geometry in every space the
/// pipeline needs and its validity flags.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FaceObservation {
    pub face_id: FaceId,
    pub raw_rect: FaceRect,
    pub display_rect: FaceRect,
    pub ir_rect: FaceRect,
    pub mask: MaskState,
    pub area_valid: bool,
    pub size_ok: bool,
}

impl FaceObservation {
    /// Eligible for stability tracking and recognition.
    pub fn is_valid(&self) -> bool {
        self.size_ok && self.area_valid
    }

    /// Engine-facing face with camera-space geometry.
    pub fn detected(&self) -> DetectedFace {
        DetectedFace {
            face_id: self.face_id,
            rect: self.raw_rect,
        }
    }

    /// Engine-facing face with IR-space geometry.
    pub fn detected_ir(&self) -> DetectedFace {
        DetectedFace {
            face_id: self.face_id,
            rect: self.ir_rect,
        }
    }
}

/// Edge-triggered population signals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    PopulationChanged { present: bool },
    FaceCountChanged { count: usize, face_ids: Vec<FaceId> },
}

/// Turns one frame's raw detections into normalized observations and
/// tracks presence and count between frames.
pub struct FaceTracker {
    config: Arc<RecognitionConfig>,
    present: bool,
    count: usize,
}

impl FaceTracker {
    pub fn new(config: Arc<RecognitionConfig>) -> Self {
        Self {
            config,
            present: false,
            count: 0,
        }
    }

    /// Compares this frame's detections with the previous frame's and
    /// reports what changed. Runs on the full detection list.
    pub fn observe_population(&mut self, faces: &[DetectedFace]) -> Vec<TrackerEvent> {
        let mut events = Vec::new();

        let present = !faces.is_empty();
        if present != self.present {
            self.present = present;
            events.push(TrackerEvent::PopulationChanged { present });
        }

        if faces.len() != self.count {
            self.count = faces.len();
            events.push(TrackerEvent::FaceCountChanged {
                count: faces.len(),
                face_ids: faces.iter().map(|f| f.face_id).collect(),
            });
        }

        events
    }

    /// Collapses to the largest face when configured. The first face wins
    /// ties.
    pub fn collapse(&self, faces: &mut Vec<DetectedFace>) {
        if !self.config.keep_max_face || faces.len() <= 1 {
            return;
        }
        let mut largest = faces[0];
        for face in faces.iter().skip(1) {
            if face.rect.area() > largest.rect.area() {
                largest = *face;
            }
        }
        faces.clear();
        faces.push(largest);
    }

    /// Builds the observation list. `masks` only applies when it has one
    /// entry per face; otherwise every face keeps `MaskState::Unknown`.
    pub fn observe(
        &self,
        faces: &[DetectedFace],
        masks: &[MaskState],
        transformer: &RectTransformer,
    ) -> Vec<FaceObservation> {
        let area = transformer.recognition_area(self.config.enable_area_limit, self.config.area_ratio);
        let use_masks = masks.len() == faces.len();

        faces
            .iter()
            .enumerate()
            .map(|(i, face)| {
                let display_rect = transformer.to_display(&face.rect);
                FaceObservation {
                    face_id: face.face_id,
                    raw_rect: face.rect,
                    display_rect,
                    ir_rect: transformer.to_ir(&display_rect),
                    mask: if use_masks { masks[i] } else { MaskState::Unknown },
                    area_valid: area.contains(&display_rect),
                    size_ok: face.rect.meets_size(self.config.face_size_limit),
                }
            })
            .collect()
    }
}
