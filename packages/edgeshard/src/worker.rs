//! Stop signals and the background compaction worker.
//!
//! A [`StopSignal`] is the receiving end of a zero-capacity channel that
//! never carries a message. Stopping drops the sender, which disconnects
//! every receiver at once, so any number of threads can poll or block on
//! the same signal without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionPlanner, CompactionStatus};
use crate::edge::{EdgeMeta, Scope};
use crate::error::ShardError;
use crate::store::EdgeStore;

// ── Stop Signal ────────────────────────────────────────────────────

/// Create a connected stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (sender, receiver) = bounded(0);
    let handle = StopHandle {
        sender: Mutex::new(Some(sender)),
        receiver: receiver.clone(),
    };
    (handle, StopSignal { receiver: Some(receiver) })
}

/// Raises the stop signal. Dropping the handle raises it too.
#[derive(Debug)]
pub struct StopHandle {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let mut sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    /// Another signal connected to this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            receiver: Some(self.receiver.clone()),
        }
    }
}

/// Cheap to clone; every clone observes the same stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: Option<Receiver<()>>,
}

impl StopSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        Self { receiver: None }
    }

    pub fn is_stopped(&self) -> bool {
        match &self.receiver {
            Some(receiver) => matches!(receiver.try_recv(), Err(TryRecvError::Disconnected)),
            None => false,
        }
    }

    /// Block for up to `timeout`. Returns true if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.receiver {
            Some(receiver) => matches!(receiver.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected)),
            None => {
                thread::sleep(timeout);
                false
            }
        }
    }
}

// ── Compaction Worker ──────────────────────────────────────────────

/// Background thread that drives compaction for a fixed set of edge
/// paths, independent of read traffic.
///
/// Each pass runs `CompactionPlanner::drive` for every path, then sleeps
/// for `interval` or until stopped. A stop raised mid-migration cancels
/// the migration between pages and releases its claim.
pub struct CompactionWorker {
    handle: StopHandle,
    thread: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl CompactionWorker {
    pub fn spawn<S>(planner: Arc<CompactionPlanner<S>>, paths: Vec<(Scope, EdgeMeta)>, interval: Duration) -> Self
    where
        S: EdgeStore + 'static,
    {
        let (handle, signal) = stop_signal();
        let passes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&passes);

        let thread = thread::spawn(move || {
            info!(paths = paths.len(), interval_ms = interval.as_millis() as u64, "compaction worker started");
            loop {
                for (scope, meta) in &paths {
                    match planner.drive(scope, meta, &signal) {
                        Ok(statuses) => {
                            let pending = statuses
                                .iter()
                                .filter(|(_, status)| *status != CompactionStatus::Complete)
                                .count();
                            debug!(%meta, groups = statuses.len(), pending, "compaction pass");
                        }
                        Err(ShardError::Cancelled) => {
                            info!("compaction worker cancelled");
                            return;
                        }
                        Err(err) if err.is_fatal() => {
                            error!(%meta, error = %err, "shard topology invariant violated");
                        }
                        Err(err) => {
                            warn!(%meta, error = %err, "compaction pass failed");
                        }
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                if signal.wait_timeout(interval) {
                    info!("compaction worker stopped");
                    return;
                }
            }
        });

        Self {
            handle,
            thread: Some(thread),
            passes,
        }
    }

    /// Completed passes over all paths.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Raise the stop signal and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("compaction worker panicked");
            }
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
