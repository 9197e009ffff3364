//! Cancellable timers.
//!
//! Every background loop in the engine runs inside a [`TimerSlot`]. A slot
//! holds at most one live task; re-arming cancels the previous task and
//! bumps a generation counter so a tick that was already in flight when
//! the slot changed sees a stale generation and does nothing.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of wall-clock time. Session timestamps are absolute, so the
/// scheduler needs real UTC time rather than a monotonic instant.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A spawned task together with the token that stops it.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawns `make(token)` on the current runtime.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let join = tokio::spawn(make(token.clone()));
        Self { token, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the task and aborts it if it is parked outside a
    /// cancellation point.
    pub fn dispose(&self) {
        self.token.cancel();
        self.join.abort();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Owner of a single timer task.
#[derive(Debug)]
pub struct TimerSlot {
    name: &'static str,
    generation: Arc<AtomicU64>,
    current: Mutex<Option<TaskHandle>>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(None),
        }
    }

    /// Returns `true` while a task armed on this slot is still running.
    pub fn is_armed(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Runs `tick` every `period`, first after one full period, until it
    /// returns [`ControlFlow::Break`] or the slot is re-armed or disposed.
    ///
    /// A tick that overruns the period delays the next one instead of
    /// bursting, so ticks never overlap.
    pub fn arm_repeating<F, Fut>(&self, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.arm_repeating_after(period, period, tick);
    }

    /// [`arm_repeating`](Self::arm_repeating) with the first tick after
    /// `first` instead of one full period.
    pub fn arm_repeating_after<F, Fut>(&self, first: Duration, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let generation = Arc::clone(&self.generation);
        let armed_at = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = self.name;

        let handle = TaskHandle::spawn(move |token| async move {
            let mut interval = tokio::time::interval_at(Instant::now() + first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if generation.load(Ordering::SeqCst) != armed_at {
                    debug!(timer = name, "Stale tick ignored");
                    break;
                }
                let flow = tokio::select! {
                    () = token.cancelled() => break,
                    flow = tick() => flow,
                };
                if flow.is_break() {
                    debug!(timer = name, "Timer stopped itself");
                    break;
                }
            }
        });

        self.replace(handle);
    }

    /// Runs `fire` once after `delay` unless the slot is re-armed or
    /// disposed first.
    pub fn arm_once<Fut>(&self, delay: Duration, fire: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = Arc::clone(&self.generation);
        let armed_at = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = self.name;

        let handle = TaskHandle::spawn(move |token| async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if generation.load(Ordering::SeqCst) != armed_at {
                debug!(timer = name, "Stale wake ignored");
                return;
            }
            tokio::select! {
                () = token.cancelled() => {}
                () = fire => {}
            }
        });

        self.replace(handle);
    }

    /// Stops the current task, if any. Idempotent.
    pub fn dispose(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().take() {
            handle.dispose();
            debug!(timer = self.name, "Timer disposed");
        }
    }

    fn replace(&self, handle: TaskHandle) {
        if let Some(previous) = self.current.lock().replace(handle) {
            previous.dispose();
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.dispose();
    }
}
