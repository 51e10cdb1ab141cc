use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::engine::domain::face_engine::{FaceId, LivenessVerdict, MaskState};

/// How often a blocked waiter re-checks the shutdown flag.
const WAIT_POLL: Duration = Duration::from_millis(50);

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecognizeStatus {
    ToRetry,
    Searching,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LivenessState {
    Unknown,
    Analyzing,
    Alive,
    NotAlive,
    Failed,
}

/// Result of blocking until liveness resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Liveness reached `Alive` or `Failed`.
    Resolved(LivenessState),
    /// The entry left the registry while waiting.
    Removed,
    /// The pipeline is shutting down.
    Interrupted,
}

/// Point-in-time copy of an entry, safe to hand to consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub face_id: FaceId,
    pub recognize_status: RecognizeStatus,
    pub liveness: LivenessState,
    pub mask: MaskState,
    pub liveness_retry_count: u32,
    pub extract_retry_count: u32,
    pub message: Option<String>,
}

#[derive(Debug)]
struct EntryState {
    recognize_status: RecognizeStatus,
    liveness: LivenessState,
    mask: MaskState,
    liveness_retry_count: u32,
    extract_retry_count: u32,
    message: Option<String>,
    removed: bool,
}

/// Recognition state for one tracked face.
///
/// Every mutation goes through a method that enforces the legal status
/// edges and is rejected once the entry has been removed. The condition
/// variable orders feature extraction after liveness resolution; removal
/// always notifies it.
#[derive(Debug)]
pub struct RecognizeEntry {
    face_id: FaceId,
    epoch: u64,
    state: Mutex<EntryState>,
    changed: Condvar,
}

impl RecognizeEntry {
    pub fn new(face_id: FaceId) -> Self {
        Self {
            face_id,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(EntryState {
                recognize_status: RecognizeStatus::ToRetry,
                liveness: LivenessState::Unknown,
                mask: MaskState::Unknown,
                liveness_retry_count: 0,
                extract_retry_count: 0,
                message: None,
                removed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn face_id(&self) -> FaceId {
        self.face_id
    }

    /// Distinguishes this entry from an earlier or later one for the same
    /// face id.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let s = self.lock();
        EntrySnapshot {
            face_id: self.face_id,
            recognize_status: s.recognize_status,
            liveness: s.liveness,
            mask: s.mask,
            liveness_retry_count: s.liveness_retry_count,
            extract_retry_count: s.extract_retry_count,
            message: s.message.clone(),
        }
    }

    pub fn recognize_status(&self) -> RecognizeStatus {
        self.lock().recognize_status
    }

    pub fn liveness(&self) -> LivenessState {
        self.lock().liveness
    }

    pub fn is_removed(&self) -> bool {
        self.lock().removed
    }

    pub fn set_mask(&self, mask: MaskState) {
        let mut s = self.lock();
        if !s.removed {
            s.mask = mask;
        }
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let mut s = self.lock();
        if !s.removed {
            s.message = Some(message.into());
        }
    }

    // ── Liveness ─────────────────────────────────────────────────────

    /// `Unknown -> Analyzing`, only while recognition has not succeeded.
    pub fn begin_liveness(&self) -> bool {
        let mut s = self.lock();
        if s.removed
            || s.recognize_status == RecognizeStatus::Succeeded
            || s.liveness != LivenessState::Unknown
        {
            return false;
        }
        self.set_liveness(&mut s, LivenessState::Analyzing);
        true
    }

    /// Applies a decisive engine verdict. `Undetermined` sends the entry
    /// back to `Unknown` for another attempt.
    pub fn resolve_liveness(&self, verdict: LivenessVerdict) -> bool {
        let mut s = self.lock();
        if s.removed || s.liveness != LivenessState::Analyzing {
            return false;
        }
        let next = match verdict {
            LivenessVerdict::Alive => LivenessState::Alive,
            LivenessVerdict::NotAlive => LivenessState::NotAlive,
            LivenessVerdict::Undetermined(_) => LivenessState::Unknown,
        };
        self.set_liveness(&mut s, next);
        if next == LivenessState::Alive {
            self.changed.notify_all();
        }
        true
    }

    /// Counts an engine failure. Within `budget` the entry returns to
    /// `Unknown`; past it the counter resets, liveness becomes `Failed`
    /// and waiters are released. Returns `true` when the budget ran out.
    pub fn liveness_engine_failed(&self, budget: u32) -> bool {
        let mut s = self.lock();
        if s.removed || s.liveness != LivenessState::Analyzing {
            return false;
        }
        s.liveness_retry_count += 1;
        if s.liveness_retry_count > budget {
            s.liveness_retry_count = 0;
            self.set_liveness(&mut s, LivenessState::Failed);
            self.changed.notify_all();
            true
        } else {
            self.set_liveness(&mut s, LivenessState::Unknown);
            false
        }
    }

    /// `Analyzing -> Unknown` when the task never reached a worker.
    pub fn abandon_liveness(&self) -> bool {
        let mut s = self.lock();
        if s.removed || s.liveness != LivenessState::Analyzing {
            return false;
        }
        self.set_liveness(&mut s, LivenessState::Unknown);
        true
    }

    /// Delayed reset: `NotAlive | Failed -> Unknown`.
    pub fn reset_liveness(&self) -> bool {
        let mut s = self.lock();
        if s.removed || !matches!(s.liveness, LivenessState::NotAlive | LivenessState::Failed) {
            return false;
        }
        self.set_liveness(&mut s, LivenessState::Unknown);
        s.message = Some(self.face_id.to_string());
        true
    }

    // ── Recognition ──────────────────────────────────────────────────

    /// `ToRetry -> Searching`.
    pub fn begin_search(&self) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::ToRetry {
            return false;
        }
        self.set_status(&mut s, RecognizeStatus::Searching);
        true
    }

    /// `Searching -> Succeeded`, with the message shown for the face.
    pub fn succeed(&self, message: impl Into<String>) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::Searching {
            return false;
        }
        self.set_status(&mut s, RecognizeStatus::Succeeded);
        s.message = Some(message.into());
        true
    }

    /// `Searching -> Failed`.
    pub fn fail_search(&self) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::Searching {
            return false;
        }
        self.set_status(&mut s, RecognizeStatus::Failed);
        true
    }

    /// `Searching -> ToRetry` when the task never reached a worker.
    pub fn abandon_search(&self) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::Searching {
            return false;
        }
        self.set_status(&mut s, RecognizeStatus::ToRetry);
        true
    }

    /// Counts an extraction failure. Within `budget` the entry returns to
    /// `ToRetry`; past it the counter resets and the entry fails. Returns
    /// `true` when the budget ran out.
    pub fn extract_failed(&self, budget: u32) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::Searching {
            return false;
        }
        s.extract_retry_count += 1;
        if s.extract_retry_count > budget {
            s.extract_retry_count = 0;
            self.set_status(&mut s, RecognizeStatus::Failed);
            true
        } else {
            self.set_status(&mut s, RecognizeStatus::ToRetry);
            false
        }
    }

    /// Delayed reset: `Failed -> ToRetry` with both counters cleared.
    pub fn reset_recognize(&self) -> bool {
        let mut s = self.lock();
        if s.removed || s.recognize_status != RecognizeStatus::Failed {
            return false;
        }
        self.set_status(&mut s, RecognizeStatus::ToRetry);
        s.extract_retry_count = 0;
        s.liveness_retry_count = 0;
        s.message = Some(self.face_id.to_string());
        true
    }

    // ── Monitor ──────────────────────────────────────────────────────

    /// Blocks until liveness is `Alive` or `Failed`, the entry is removed,
    /// or `shutdown` is set.
    pub fn wait_for_liveness(&self, shutdown: &AtomicBool) -> WaitOutcome {
        let mut s = self.lock();
        loop {
            if s.removed {
                return WaitOutcome::Removed;
            }
            if shutdown.load(Ordering::SeqCst) {
                return WaitOutcome::Interrupted;
            }
            if matches!(s.liveness, LivenessState::Alive | LivenessState::Failed) {
                return WaitOutcome::Resolved(s.liveness);
            }
            s = match self.changed.wait_timeout(s, WAIT_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Marks the entry dead and wakes every waiter. Idempotent.
    pub fn mark_removed(&self) {
        let mut s = self.lock();
        s.removed = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, s: &mut EntryState, next: RecognizeStatus) {
        log::debug!(
            "face {} recognize {:?} -> {:?}",
            self.face_id,
            s.recognize_status,
            next
        );
        s.recognize_status = next;
    }

    fn set_liveness(&self, s: &mut EntryState, next: LivenessState) {
        log::debug!("face {} liveness {:?} -> {:?}", self.face_id, s.liveness, next);
        s.liveness = next;
    }
}
