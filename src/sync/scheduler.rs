use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::clock::{Clock, TimerHandle};
use crate::error::Result;

/// The commit action driven by the scheduler. Resolves to whether a commit
/// actually landed.
pub type CommitFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

#[derive(Default)]
struct SchedulerState {
    pending: bool,
    timer: Option<TimerHandle>,
    /// Bumped on every arm, cancel and commit. A fired timer whose generation
    /// is stale by the time it gets the gate does nothing.
    generation: u64,
    /// Clock time at which the last landed commit finished.
    last_commit_at: Option<Duration>,
}

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    debounce: Duration,
    min_interval: Duration,
    commit: CommitFn,
    state: Mutex<SchedulerState>,
    /// Held for the whole of a commit attempt; commits never overlap.
    gate: tokio::sync::Mutex<()>,
}

/// Debounce with a minimum interval between commits.
///
/// `mark_dirty` (re)arms a debounce timer. When it fires, the commit runs
/// unless the last commit finished less than `min_interval` ago, in which
/// case the timer is re-armed for the remainder. A failed commit sets the
/// scheduler dirty again; retryable failures also re-arm the debounce, so
/// nothing is dropped. Configuration and auth failures wait for the next
/// `mark_dirty` or flush.
#[derive(Clone)]
pub struct CommitScheduler {
    inner: Arc<SchedulerInner>,
}

impl CommitScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        debounce: Duration,
        min_interval: Duration,
        commit: CommitFn,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                debounce,
                min_interval,
                commit,
                state: Mutex::new(SchedulerState::default()),
                gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn mark_dirty(&self) {
        let mut state = self.inner.state.lock();
        state.pending = true;
        self.inner.arm(&mut state, self.inner.debounce);
    }

    /// Flag pending work without arming the timer. The next `flush` commits it.
    pub fn mark_pending(&self) {
        self.inner.state.lock().pending = true;
    }

    /// Commit now if anything is pending, unless the minimum interval has
    /// not elapsed, in which case a timer is armed for the remainder.
    /// Returns whether a commit landed.
    pub async fn flush(&self) -> Result<bool> {
        self.inner.try_commit(None).await
    }

    /// Commit now, ignoring the minimum interval.
    pub async fn flush_unsafe(&self) -> Result<bool> {
        let _gate = self.inner.gate.lock().await;
        self.inner.do_commit().await
    }

    /// Disarm the timer. Pending work stays flagged.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        self.inner.disarm(&mut state);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    pub fn last_commit_at(&self) -> Option<Duration> {
        self.inner.state.lock().last_commit_at
    }
}

impl SchedulerInner {
    fn disarm(&self, state: &mut SchedulerState) {
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            self.clock.cancel_timer(timer);
        }
    }

    fn arm(self: &Arc<Self>, state: &mut SchedulerState, delay: Duration) {
        self.disarm(state);
        let generation = state.generation;
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = self.clock.set_timer(
            delay,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                {
                    let mut state = inner.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.timer = None;
                }
                tokio::spawn(async move {
                    if let Err(e) = inner.try_commit(Some(generation)).await {
                        tracing::warn!("scheduled commit failed: {}", e);
                    }
                });
            }),
        );
        state.timer = Some(handle);
    }

    /// `fired` carries the generation of the timer that started this attempt.
    async fn try_commit(self: &Arc<Self>, fired: Option<u64>) -> Result<bool> {
        let _gate = self.gate.lock().await;
        {
            let mut state = self.state.lock();
            if fired.is_some_and(|generation| generation != state.generation) {
                tracing::trace!("superseded timer, skipping commit");
                return Ok(false);
            }
            if !state.pending {
                return Ok(false);
            }
            if let Some(last) = state.last_commit_at {
                let ready_at = last + self.min_interval;
                let now = self.clock.now();
                if now < ready_at {
                    let wait = ready_at - now;
                    tracing::debug!("minimum interval not reached, waiting {:?}", wait);
                    self.arm(&mut state, wait);
                    return Ok(false);
                }
            }
        }
        self.do_commit().await
    }

    /// Caller holds the gate.
    async fn do_commit(self: &Arc<Self>) -> Result<bool> {
        {
            let mut state = self.state.lock();
            state.pending = false;
            self.disarm(&mut state);
        }

        let result = (self.commit)().await;

        let mut state = self.state.lock();
        match result {
            Ok(landed) => {
                if landed {
                    state.last_commit_at = Some(self.clock.now());
                }
                Ok(landed)
            }
            Err(e) => {
                state.pending = true;
                if e.is_retryable() {
                    self.arm(&mut state, self.debounce);
                } else {
                    tracing::debug!("not retrying automatically: {}", e);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::SyncError, sync::clock::ManualClock};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        clock: Arc<ManualClock>,
        scheduler: CommitScheduler,
        calls: Arc<AtomicUsize>,
    }

    /// The commit fails while `calls < fail_first`.
    fn harness(debounce_ms: u64, min_interval_ms: u64, fail_first: usize) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let commit: CommitFn = Arc::new(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(SyncError::Transport("offline".to_string()))
                } else {
                    Ok(true)
                }
            }
            .boxed()
        });
        let scheduler = CommitScheduler::new(
            clock.clone(),
            Duration::from_millis(debounce_ms),
            Duration::from_millis(min_interval_ms),
            commit,
        );
        Harness {
            clock,
            scheduler,
            calls,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn test_debounce_collapses_marks() {
        let h = harness(30_000, 0, 0);
        h.scheduler.mark_dirty();
        h.clock.advance(ms(10_000)).await;
        h.scheduler.mark_dirty();
        h.clock.advance(ms(10_000)).await;
        h.scheduler.mark_dirty();
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        h.clock.advance(ms(50_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(!h.scheduler.is_pending());
    }

    #[tokio::test]
    async fn test_minimum_interval_defers_second_commit() {
        let h = harness(1_000, 60_000, 0);
        h.scheduler.mark_dirty();
        h.clock.advance(ms(1_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        h.scheduler.mark_dirty();
        h.clock.advance(ms(1_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.scheduler.is_pending());

        h.clock.advance(ms(58_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        h.clock.advance(ms(1_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_rearms_debounce() {
        let h = harness(1_000, 0, 1);
        h.scheduler.mark_dirty();
        h.clock.advance(ms(1_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.scheduler.is_pending());
        assert!(h.scheduler.is_armed());

        h.clock.advance(ms(1_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(!h.scheduler.is_pending());
        assert_eq!(h.scheduler.last_commit_at(), Some(ms(2_000)));
    }

    #[tokio::test]
    async fn test_flush_respects_interval_and_unsafe_does_not() {
        let h = harness(1_000, 60_000, 0);
        h.scheduler.mark_dirty();
        assert!(h.scheduler.flush().await.unwrap());

        h.scheduler.mark_dirty();
        assert!(!h.scheduler.flush().await.unwrap());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        assert!(h.scheduler.flush_unsafe().await.unwrap());
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(!h.scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_noop() {
        let h = harness(1_000, 0, 0);
        assert!(!h.scheduler.flush().await.unwrap());
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_error_propagates() {
        let h = harness(1_000, 0, 1);
        h.scheduler.mark_pending();
        let err = h.scheduler.flush().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(h.scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_cancel_disarms() {
        let h = harness(1_000, 0, 0);
        h.scheduler.mark_dirty();
        h.scheduler.cancel();
        h.clock.advance(ms(5_000)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.scheduler.is_pending());
    }

    fn scheduler_with(clock: &Arc<ManualClock>, commit: CommitFn) -> CommitScheduler {
        CommitScheduler::new(clock.clone(), ms(1_000), ms(60_000), commit)
    }

    #[tokio::test]
    async fn test_config_failure_is_not_rearmed() {
        let clock = Arc::new(ManualClock::new());
        let commit: CommitFn = Arc::new(|| {
            async { Err::<bool, _>(SyncError::Config("owner is not set".to_string())) }.boxed()
        });
        let scheduler = scheduler_with(&clock, commit);

        scheduler.mark_dirty();
        clock.advance(ms(1_000)).await;
        assert!(scheduler.is_pending());
        assert!(!scheduler.is_armed());
        assert_eq!(clock.pending_timers(), 0);

        let err = scheduler.flush().await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(!scheduler.is_armed());

        // A fresh dirty signal still schedules an attempt.
        scheduler.mark_dirty();
        assert!(scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_empty_commit_does_not_start_interval() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let commit: CommitFn = Arc::new(move || {
            let counter = counter.clone();
            // Nothing to commit on the first call.
            async move { Ok::<_, SyncError>(counter.fetch_add(1, Ordering::SeqCst) > 0) }.boxed()
        });
        let scheduler = scheduler_with(&clock, commit);

        scheduler.mark_dirty();
        clock.advance(ms(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.last_commit_at(), None);

        scheduler.mark_dirty();
        clock.advance(ms(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.last_commit_at(), Some(ms(2_000)));
    }

    #[tokio::test]
    async fn test_mark_dirty_supersedes_timer_waiting_on_gate() {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let commit: CommitFn = {
            let calls = calls.clone();
            let release = release.clone();
            Arc::new(move || {
                let calls = calls.clone();
                let release = release.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        release
                            .acquire()
                            .await
                            .map_err(|e| SyncError::Transport(e.to_string()))?
                            .forget();
                    }
                    Ok::<_, SyncError>(true)
                }
                .boxed()
            })
        };
        let scheduler = CommitScheduler::new(clock.clone(), ms(1_000), Duration::ZERO, commit);

        let in_flight = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.flush_unsafe().await }
        });
        clock.advance(Duration::ZERO).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        scheduler.mark_dirty();
        // Fires at t=1000 and queues behind the in-flight commit.
        clock.advance(ms(1_000)).await;
        // Restarts the quiet period: next attempt due at t=2000.
        scheduler.mark_dirty();

        release.add_permits(1);
        assert!(in_flight.await.unwrap().unwrap());
        clock.advance(Duration::ZERO).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_pending());

        clock.advance(ms(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_pending());
    }
}
