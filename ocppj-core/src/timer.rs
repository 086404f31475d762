//! Request deadlines
//!
//! The correlation queue arms one deadline per call in flight. `TokioTimer`
//! backs deadlines with runtime sleeps; `ManualTimer` is a fake clock that
//! only moves when told to, for deterministic timeout tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Callback fired when a deadline passes
pub type Expiry = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an armed deadline
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the deadline; its expiry callback will not run
    pub fn disarm(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Deadline scheduler
pub trait Timer: Send + Sync {
    /// Run `on_expiry` once `after` has elapsed, unless disarmed first
    fn arm(&self, after: Duration, on_expiry: Expiry) -> TimerHandle;
}

/// Deadlines backed by `tokio::time::sleep` on a runtime
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Timer on the runtime the caller is running on, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Timer for TokioTimer {
    fn arm(&self, after: Duration, on_expiry: Expiry) -> TimerHandle {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            on_expiry();
        });
        TimerHandle::new(move || task.abort())
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_key: u64,
    /// (deadline, arm order) -> expiry
    pending: BTreeMap<(Duration, u64), Expiry>,
}

/// Fake clock: deadlines fire only from `advance`
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward, firing every deadline reached in deadline order
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += by;
            let cutoff = (state.now + Duration::from_nanos(1), 0);
            let later = state.pending.split_off(&cutoff);
            std::mem::replace(&mut state.pending, later)
        };

        // Fired outside the lock: expiries may arm new deadlines.
        for (_, expiry) in due {
            expiry();
        }
    }

    /// Number of armed, not yet fired deadlines
    pub fn armed(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn now(&self) -> Duration {
        self.state.lock().now
    }
}

impl Timer for ManualTimer {
    fn arm(&self, after: Duration, on_expiry: Expiry) -> TimerHandle {
        let key = {
            let mut state = self.state.lock();
            state.next_key += 1;
            let key = (state.now + after, state.next_key);
            state.pending.insert(key, on_expiry);
            key
        };

        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().pending.remove(&key);
            }
        })
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("armed", &state.pending.len())
            .finish()
    }
}
