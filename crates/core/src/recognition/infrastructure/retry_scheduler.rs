use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::engine::domain::face_engine::FaceId;
use crate::shared::constants::RETRY_SCHEDULER_NAME;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetAction {
    /// `Failed -> ToRetry`.
    Recognize,
    /// `NotAlive | Failed -> Unknown`.
    Liveness,
}

/// A delayed reset addressed to one specific entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResetTask {
    pub face_id: FaceId,
    pub epoch: u64,
    pub action: ResetAction,
}

pub type ResetSink = Box<dyn Fn(ResetTask) + Send + 'static>;

enum Command {
    Schedule(Instant, ResetTask),
    Cancel { face_id: FaceId, epoch: u64 },
    Shutdown,
}

/// One timer thread that fires delayed state resets in deadline order.
///
/// Fired tasks go to the sink, which is responsible for ignoring tasks
/// whose entry is gone. Cancelling an entry drops all its pending tasks.
pub struct RetryScheduler {
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn start(sink: ResetSink) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(RETRY_SCHEDULER_NAME.to_string())
            .spawn(move || run_timer(rx, sink))?;
        Ok(Self {
            commands: tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn schedule(&self, task: ResetTask, delay: Duration) {
        log::debug!("face {} {:?} reset in {delay:?}", task.face_id, task.action);
        if self
            .commands
            .send(Command::Schedule(Instant::now() + delay, task))
            .is_err()
        {
            log::warn!("retry scheduler stopped, dropping reset for face {}", task.face_id);
        }
    }

    pub fn cancel(&self, face_id: FaceId, epoch: u64) {
        let _ = self.commands.send(Command::Cancel { face_id, epoch });
    }

    /// Stops the timer; pending resets are discarded. Idempotent.
    pub fn shutdown(&self) {
        let handle = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                log::error!("retry scheduler exited abnormally");
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(commands: Receiver<Command>, sink: ResetSink) {
    let mut pending: BinaryHeap<Reverse<(Instant, u64, ResetTask)>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let next = match pending.peek() {
            Some(Reverse((at, _, _))) => {
                commands.recv_timeout(at.saturating_duration_since(Instant::now()))
            }
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(Command::Schedule(at, task)) => {
                seq += 1;
                pending.push(Reverse((at, seq, task)));
            }
            Ok(Command::Cancel { face_id, epoch }) => {
                pending.retain(|Reverse((_, _, t))| !(t.face_id == face_id && t.epoch == epoch));
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while let Some(Reverse((at, _, _))) = pending.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, task))) = pending.pop() {
                sink(task);
            }
        }
    }
}
