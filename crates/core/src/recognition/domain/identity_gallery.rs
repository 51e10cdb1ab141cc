use serde::{Deserialize, Serialize};

use crate::engine::domain::face_engine::FaceFeature;

/// One enrolled identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrolledFace {
    pub id: u64,
    pub name: String,
    pub feature: FaceFeature,
}

/// Source of enrolled identities for 1:N matching.
///
/// Shared by every feature worker, so implementations must be readable
/// from several threads at once.
pub trait IdentityGallery: Send + Sync {
    fn enrolled(&self) -> &[EnrolledFace];

    /// Minimum similarity for a match to count as recognised.
    fn similarity_threshold(&self) -> f32;
}

/// Fixed in-memory gallery.
#[derive(Clone, Debug, Default)]
pub struct StaticGallery {
    faces: Vec<EnrolledFace>,
    threshold: f32,
}

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

impl StaticGallery {
    pub fn new(faces: Vec<EnrolledFace>, threshold: f32) -> Self {
        Self { faces, threshold }
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

impl IdentityGallery for StaticGallery {
    fn enrolled(&self) -> &[EnrolledFace] {
        &self.faces
    }

    fn similarity_threshold(&self) -> f32 {
        self.threshold
    }
}
