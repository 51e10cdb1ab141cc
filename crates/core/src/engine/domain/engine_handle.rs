use std::sync::{Mutex, MutexGuard};

/// Exclusive-access wrapper around one non-reentrant engine sub-handle.
///
/// The lock is held only for the duration of a single `call`, never across
/// a wait, so stages sharing a sub-handle serialize their engine work while
/// the rest of their task runs concurrently.
pub struct EngineHandle<T: ?Sized> {
    label: &'static str,
    engine: Mutex<Box<T>>,
}

impl<T: ?Sized> EngineHandle<T> {
    pub fn new(label: &'static str, engine: Box<T>) -> Self {
        Self {
            label,
            engine: Mutex::new(engine),
        }
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn call<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut **guard)
    }

    fn lock(&self) -> MutexGuard<'_, Box<T>> {
        // A worker that panicked mid-call leaves the engine usable for others.
        self.engine.lock().unwrap_or_else(|poisoned| {
            log::warn!("{} engine lock poisoned, recovering", self.label);
            poisoned.into_inner()
        })
    }
}
