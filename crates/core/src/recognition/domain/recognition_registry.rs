use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::recognize_entry::{EntrySnapshot, RecognizeEntry};
use crate::engine::domain::face_engine::FaceId;

/// Owns one `RecognizeEntry` per tracked face.
///
/// The map lock and an entry's own lock are never held together: removal
/// takes entries out of the map first, then marks each one removed, which
/// wakes anything blocked on it.
#[derive(Default)]
pub struct RecognitionRegistry {
    entries: Mutex<HashMap<FaceId, Arc<RecognizeEntry>>>,
}

impl RecognitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `face_id`, creating it on first sighting.
    pub fn get_or_create(&self, face_id: FaceId) -> Arc<RecognizeEntry> {
        self.lock()
            .entry(face_id)
            .or_insert_with(|| {
                log::debug!("tracking new face {face_id}");
                Arc::new(RecognizeEntry::new(face_id))
            })
            .clone()
    }

    pub fn get(&self, face_id: FaceId) -> Option<Arc<RecognizeEntry>> {
        self.lock().get(&face_id).cloned()
    }

    /// True iff `entry` is still the live entry for its face id.
    pub fn is_current(&self, entry: &Arc<RecognizeEntry>) -> bool {
        self.get(entry.face_id())
            .is_some_and(|live| Arc::ptr_eq(&live, entry))
    }

    /// Removes every entry whose face id is not in `live`, returning them.
    pub fn retain(&self, live: &HashSet<FaceId>) -> Vec<Arc<RecognizeEntry>> {
        let removed: Vec<_> = {
            let mut entries = self.lock();
            let gone: Vec<FaceId> = entries
                .keys()
                .filter(|id| !live.contains(id))
                .copied()
                .collect();
            gone.iter().filter_map(|id| entries.remove(id)).collect()
        };
        for entry in &removed {
            log::debug!("face {} left", entry.face_id());
            entry.mark_removed();
        }
        removed
    }

    pub fn remove(&self, face_id: FaceId) -> Option<Arc<RecognizeEntry>> {
        let entry = self.lock().remove(&face_id)?;
        entry.mark_removed();
        Some(entry)
    }

    /// Removes everything, waking all waiters.
    pub fn clear(&self) -> Vec<Arc<RecognizeEntry>> {
        let removed: Vec<_> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in &removed {
            entry.mark_removed();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshots ordered by face id.
    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.face_id());
        entries.iter().map(|e| e.snapshot()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FaceId, Arc<RecognizeEntry>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
