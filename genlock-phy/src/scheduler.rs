//! One-shot timers backed by a dedicated thread.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use genlock_if::timer::{Scheduler, TimerId, TimerPayload};
use spin::Mutex;

type Deadlines = BTreeMap<(Instant, TimerId), TimerPayload>;

struct Shared {
    pending: Mutex<Deadlines>,
    stop: AtomicBool,
}

impl Shared {
    /// Removes the earliest timer if it is due, otherwise reports its deadline.
    fn take_due(&self, now: Instant) -> Result<(TimerId, TimerPayload), Option<Instant>> {
        let mut pending = self.pending.lock();
        let earliest = pending.first_key_value().map(|(&(deadline, _), _)| deadline);
        match earliest {
            Some(deadline) if deadline <= now => pending
                .pop_first()
                .map(|((_, id), payload)| (id, payload))
                .ok_or(None),
            other => Err(other),
        }
    }
}

/// Runs timer payloads on its own thread. Payloads run without any internal
/// lock held, so they may arm or cancel timers themselves.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    wake: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
        });
        let (wake, rx) = channel::unbounded();

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("genlock-timer".into())
                .spawn(move || Self::run(shared, rx))
                .map_err(|e| error!("Failed to spawn timer thread: {e}"))
                .ok()
        };

        Self {
            shared,
            next_id: AtomicU64::new(1),
            wake,
            worker,
        }
    }

    fn run(shared: Arc<Shared>, rx: Receiver<()>) {
        debug!("Timer thread started");
        while !shared.stop.load(Ordering::Acquire) {
            let wait = match shared.take_due(Instant::now()) {
                Ok((id, payload)) => {
                    debug!("Timer {} fired", id.0);
                    payload();
                    continue;
                }
                Err(Some(deadline)) => deadline.saturating_duration_since(Instant::now()),
                // Idle until something is armed.
                Err(None) => Duration::from_secs(3600),
            };

            match rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Timer thread stopped");
    }

    /// Number of timers armed and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn arm_timer(&self, duration_ms: u64, payload: TimerPayload) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + Duration::from_millis(duration_ms);
        self.shared.pending.lock().insert((deadline, id), payload);
        if self.worker.is_none() {
            warn!("Timer {} armed without a timer thread", id.0);
        }
        let _ = self.wake.send(());
        debug!("Timer {} armed for {duration_ms} ms", id.0);
        id
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let mut pending = self.shared.pending.lock();
        let key = pending.keys().find(|(_, tid)| *tid == id).copied();
        let cancelled = key.and_then(|key| pending.remove(&key)).is_some();
        drop(pending);

        if cancelled {
            debug!("Timer {} cancelled", id.0);
        }
        cancelled
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.wake.send(());
        if let Some(worker) = self.worker.take() {
            // A payload may hold the last reference to its own scheduler.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
