use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::domain::face_engine::{FaceFeature, FaceId, MaskState};
use crate::recognition::domain::identity_gallery::EnrolledFace;
use crate::recognition::domain::recognize_entry::{EntrySnapshot, LivenessState, RecognizeStatus};
use crate::shared::frame::Frame;
use crate::tracking::domain::face_tracker::FaceObservation;

/// Stage an error event originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorStage {
    DetectFaces,
    DetectMask,
    DetectLiveness,
    ImageQuality,
    ExtractFeature,
    CompareFeature,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStage::DetectFaces => "detect faces",
            ErrorStage::DetectMask => "detect mask",
            ErrorStage::DetectLiveness => "detect liveness",
            ErrorStage::ImageQuality => "image quality",
            ErrorStage::ExtractFeature => "extract feature",
            ErrorStage::CompareFeature => "compare feature",
        };
        f.write_str(name)
    }
}

/// Colour class a renderer uses for a face box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AnnotationClass {
    Unknown,
    Success,
    Failed,
}

impl AnnotationClass {
    pub fn of(snapshot: &EntrySnapshot) -> Self {
        if snapshot.recognize_status == RecognizeStatus::Succeeded {
            AnnotationClass::Success
        } else if snapshot.recognize_status == RecognizeStatus::Failed
            || snapshot.liveness == LivenessState::NotAlive
        {
            AnnotationClass::Failed
        } else {
            AnnotationClass::Unknown
        }
    }
}

/// One face of a published frame, ready for rendering.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotatedFace {
    pub observation: FaceObservation,
    pub entry: EntrySnapshot,
    pub class: AnnotationClass,
}

/// Everything the pipeline reports to its consumer, in order.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    PopulationChanged {
        present: bool,
    },
    FaceCountChanged {
        count: usize,
        face_ids: Vec<FaceId>,
    },
    OutsideRecognitionArea {
        face_id: FaceId,
    },
    StableDetection {
        face_id: FaceId,
        mask: MaskState,
        frame: Arc<Frame>,
    },
    FrameAnnotated {
        frame_index: usize,
        faces: Vec<AnnotatedFace>,
    },
    IdentityMatched {
        face_id: FaceId,
        feature: FaceFeature,
        identity: EnrolledFace,
        similarity: f32,
        entry: EntrySnapshot,
        frame: Arc<Frame>,
    },
    /// Registration mode: a feature was extracted and no comparison ran.
    FeatureExtracted {
        face_id: FaceId,
        feature: FaceFeature,
        entry: EntrySnapshot,
        frame: Arc<Frame>,
    },
    Error {
        stage: ErrorStage,
        code: i32,
        message: String,
    },
}

impl PipelineEvent {
    /// Short name for logs and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PopulationChanged { .. } => "population_changed",
            PipelineEvent::FaceCountChanged { .. } => "face_count_changed",
            PipelineEvent::OutsideRecognitionArea { .. } => "outside_recognition_area",
            PipelineEvent::StableDetection { .. } => "stable_detection",
            PipelineEvent::FrameAnnotated { .. } => "frame_annotated",
            PipelineEvent::IdentityMatched { .. } => "identity_matched",
            PipelineEvent::FeatureExtracted { .. } => "feature_extracted",
            PipelineEvent::Error { .. } => "error",
        }
    }
}
