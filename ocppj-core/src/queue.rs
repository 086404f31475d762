//! Single-flight correlation queue
//!
//! OCPP-J allows one outstanding call per direction on a connection. The
//! queue holds at most one call in flight plus a FIFO buffer of sends waiting
//! for the slot. Replies, timeouts and shutdown all settle the slot through
//! the same path, so every callback runs exactly once.
//!
//! Slot states:
//!
//! ```text
//!   Idle ──enqueue──► InFlight ──reply / deadline──► Settling ──► Idle
//!                        ▲                              │
//!                        └─────── next buffered ────────┘
//! ```
//!
//! `Settling` covers the window in which the settled call's callback runs
//! outside the lock. New sends arriving then are buffered, which keeps
//! promotion in submission order.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::OcppError;
use crate::timer::{Timer, TimerHandle};

/// Terminal outcome of an outbound call
pub type CallOutcome = Result<Value, OcppError>;

/// Performs the transport write and returns the correlation id it used.
/// Runs under the queue lock, so it must not call back into the queue.
pub type SendFn = Box<dyn FnOnce() -> Result<String, OcppError> + Send + 'static>;

/// Continuation invoked exactly once with the call's outcome
pub type Callback = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

struct PendingCall {
    message_id: String,
    generation: u64,
    deadline: TimerHandle,
    callback: Callback,
}

struct QueueEntry {
    send: SendFn,
    callback: Callback,
}

enum Slot {
    Idle,
    InFlight(PendingCall),
    Settling,
}

struct QueueState {
    slot: Slot,
    buffer: VecDeque<QueueEntry>,
    closed: bool,
    /// Bumped for every call put in flight; guards against stale deadlines
    generation: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    timer: Arc<dyn Timer>,
    timeout: Duration,
}

/// Per-connection outbound call queue
#[derive(Clone)]
pub struct CorrelationQueue {
    shared: Arc<Shared>,
}

impl CorrelationQueue {
    pub fn new(timer: Arc<dyn Timer>, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    slot: Slot::Idle,
                    buffer: VecDeque::new(),
                    closed: false,
                    generation: 0,
                }),
                timer,
                timeout,
            }),
        }
    }

    /// Submit a send
    ///
    /// With the slot idle, `send` runs immediately and its call goes in
    /// flight; otherwise the pair is buffered and this returns at once.
    /// A failing `send` settles `callback` with the send error.
    ///
    /// Fails only with `QueueClosed`, in which case `callback` is dropped
    /// without being invoked.
    pub fn enqueue(&self, send: SendFn, callback: Callback) -> Result<(), OcppError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(OcppError::QueueClosed);
        }

        if !matches!(state.slot, Slot::Idle) {
            state.buffer.push_back(QueueEntry { send, callback });
            debug!("Slot busy, buffered send ({} waiting)", state.buffer.len());
            return Ok(());
        }

        match send() {
            Ok(message_id) => {
                self.put_in_flight(&mut state, message_id, callback);
            }
            Err(e) => {
                state.slot = Slot::Settling;
                drop(state);
                warn!("Send failed: {}", e);
                settle(callback, Err(e));
                self.promote_next();
            }
        }
        Ok(())
    }

    /// Settle the call in flight with a reply
    ///
    /// A `message_id` that does not match the call in flight leaves the slot
    /// untouched and fails with `UnmatchedReply`.
    pub fn resolve(&self, message_id: &str, outcome: CallOutcome) -> Result<(), OcppError> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut state.slot, Slot::Settling) {
            Slot::InFlight(pending) if pending.message_id == message_id => {
                drop(state);
                pending.deadline.disarm();
                debug!("Call {} resolved", message_id);
                settle(pending.callback, outcome);
                self.promote_next();
                Ok(())
            }
            other => {
                let expected = match &other {
                    Slot::InFlight(pending) => Some(pending.message_id.clone()),
                    _ => None,
                };
                state.slot = other;
                Err(OcppError::UnmatchedReply {
                    message_id: message_id.to_string(),
                    expected,
                })
            }
        }
    }

    /// Cancel everything and close the queue for good
    ///
    /// The call in flight and then every buffered send are settled with
    /// `Cancelled`, in submission order. Later `enqueue` calls fail with
    /// `QueueClosed`. Calling this again is a no-op.
    pub fn shutdown(&self) {
        let (in_flight, buffered) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let in_flight = match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::InFlight(pending) => Some(pending),
                Slot::Settling => {
                    // Settling thread notices `closed` and idles the slot.
                    state.slot = Slot::Settling;
                    None
                }
                Slot::Idle => None,
            };
            let buffered: Vec<QueueEntry> = state.buffer.drain(..).collect();
            (in_flight, buffered)
        };

        debug!(
            "Queue shut down, cancelling {} call(s)",
            usize::from(in_flight.is_some()) + buffered.len()
        );

        if let Some(pending) = in_flight {
            pending.deadline.disarm();
            settle(pending.callback, Err(OcppError::Cancelled));
        }
        for entry in buffered {
            settle(entry.callback, Err(OcppError::Cancelled));
        }
    }

    /// Id of the call in flight
    pub fn in_flight(&self) -> Option<String> {
        match &self.shared.state.lock().slot {
            Slot::InFlight(pending) => Some(pending.message_id.clone()),
            _ => None,
        }
    }

    /// Number of sends waiting for the slot
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn put_in_flight(&self, state: &mut QueueState, message_id: String, callback: Callback) {
        state.generation += 1;
        let generation = state.generation;

        let queue: Weak<Shared> = Arc::downgrade(&self.shared);
        let deadline = self.shared.timer.arm(
            self.shared.timeout,
            Box::new(move || {
                if let Some(shared) = queue.upgrade() {
                    CorrelationQueue { shared }.expire(generation);
                }
            }),
        );

        debug!("Call {} in flight", message_id);
        state.slot = Slot::InFlight(PendingCall {
            message_id,
            generation,
            deadline,
            callback,
        });
    }

    /// Deadline path: settle with the timeout outcome if still current
    fn expire(&self, generation: u64) {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut state.slot, Slot::Settling) {
            Slot::InFlight(pending) if pending.generation == generation => {
                drop(state);
                warn!("Call {} timed out", pending.message_id);
                settle(pending.callback, Err(OcppError::timeout()));
                self.promote_next();
            }
            other => {
                state.slot = other;
                debug!("Ignoring stale deadline (generation {})", generation);
            }
        }
    }

    /// Fill the slot from the buffer; caller owns the `Settling` slot
    fn promote_next(&self) {
        loop {
            let mut state = self.shared.state.lock();
            if state.closed {
                state.slot = Slot::Idle;
                return;
            }

            let Some(entry) = state.buffer.pop_front() else {
                state.slot = Slot::Idle;
                return;
            };

            match (entry.send)() {
                Ok(message_id) => {
                    self.put_in_flight(&mut state, message_id, entry.callback);
                    return;
                }
                Err(e) => {
                    drop(state);
                    warn!("Send of buffered call failed: {}", e);
                    settle(entry.callback, Err(e));
                }
            }
        }
    }
}

/// Run a callback; a panic in it must not leave the slot `Settling`
fn settle(callback: Callback, outcome: CallOutcome) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        warn!("Call callback panicked, outcome dropped");
    }
}

impl std::fmt::Debug for CorrelationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        let slot = match &state.slot {
            Slot::Idle => "idle".to_string(),
            Slot::InFlight(pending) => format!("in flight ({})", pending.message_id),
            Slot::Settling => "settling".to_string(),
        };
        f.debug_struct("CorrelationQueue")
            .field("slot", &slot)
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}
