use std::sync::Arc;

use crate::engine::domain::face_engine::{FaceId, MaskState};
use crate::shared::constants::STABLE_DETECTION_RUN;
use crate::shared::frame::Frame;

/// A face seen consistently for a full run of frames.
#[derive(Clone, Debug)]
pub struct StableDetection {
    pub face_id: FaceId,
    pub mask: MaskState,
    pub frame: Arc<Frame>,
}

#[derive(Clone, Debug)]
struct Candidate {
    face_id: FaceId,
    mask: MaskState,
    frame: Arc<Frame>,
}

/// Requires a run of consistent observations before signalling a stable
/// detection.
///
/// Each candidate is compared with the most recent buffered one only. A
/// different face id or mask state restarts the run at the candidate.
pub struct StabilityBuffer {
    run: Vec<Candidate>,
    required: usize,
}

impl StabilityBuffer {
    pub fn new(required: usize) -> Self {
        Self {
            run: Vec::with_capacity(required),
            required: required.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
    }

    /// Adds a valid observation. Returns the stable detection when this
    /// candidate completes a run, after which the buffer is empty.
    pub fn offer(
        &mut self,
        face_id: FaceId,
        mask: MaskState,
        frame: &Arc<Frame>,
    ) -> Option<StableDetection> {
        let consistent = self
            .run
            .last()
            .map_or(true, |last| last.face_id == face_id && last.mask == mask);
        if !consistent {
            self.run.clear();
        }
        self.run.push(Candidate {
            face_id,
            mask,
            frame: Arc::clone(frame),
        });

        if self.run.len() < self.required {
            return None;
        }
        let first = self.run.swap_remove(0);
        self.run.clear();
        Some(StableDetection {
            face_id: first.face_id,
            mask: first.mask,
            frame: first.frame,
        })
    }
}

impl Default for StabilityBuffer {
    fn default() -> Self {
        Self::new(STABLE_DETECTION_RUN)
    }
}
