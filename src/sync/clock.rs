use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::AbortHandle, time::Instant};

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Time source and one-shot timers for the commit scheduler.
///
/// Callbacks run on the Tokio runtime, so they may `tokio::spawn`.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    fn set_timer(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// No-op for timers that already fired or were cancelled.
    fn cancel_timer(&self, handle: TimerHandle);
}

/// Wall-clock timers backed by `tokio::time::sleep`.
pub struct TokioClock {
    runtime: Handle,
    start: Instant,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            start: Instant::now(),
            next_id: AtomicU64::new(0),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn set_timer(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        // Held across spawn so the task cannot deregister before it is registered.
        let mut registered = self.tasks.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.lock().remove(&id);
            callback();
        });
        registered.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        if let Some(task) = self.tasks.lock().remove(&handle.0) {
            task.abort();
        }
    }
}

impl Drop for TokioClock {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

struct ManualTimer {
    id: u64,
    due: Duration,
    callback: TimerCallback,
}

/// Simulated clock for deterministic tests. Time only moves on `advance`.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    next_id: AtomicU64,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Move time forward by `by`, firing due timers in order. Each fire is
    /// followed by a settle so spawned work completes before time moves on.
    pub async fn advance(&self, by: Duration) {
        let target = *self.now.lock() + by;
        loop {
            let next = {
                let mut timers = self.timers.lock();
                let earliest = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.id))
                    .map(|(idx, _)| idx);
                earliest.map(|idx| timers.swap_remove(idx))
            };
            let Some(timer) = next else {
                break;
            };
            {
                let mut now = self.now.lock();
                if timer.due > *now {
                    *now = timer.due;
                }
            }
            (timer.callback)();
            settle().await;
        }
        *self.now.lock() = target;
        settle().await;
    }
}

/// Give spawned tasks on the current-thread runtime a chance to run.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn set_timer(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = *self.now.lock() + delay;
        self.timers.lock().push(ManualTimer { id, due, callback });
        TimerHandle(id)
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        self.timers.lock().retain(|t| t.id != handle.0);
    }
}
