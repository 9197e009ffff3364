//! Session-aligned refresh scheduler.
//!
//! Client state only changes when the exchange clears a session, so the
//! scheduler sleeps until just before the announced clearing time, then
//! polls the session endpoint quickly until the exchange reports a newer
//! clearing time. That transition triggers exactly one full refresh.
//!
//! ```text
//! WaitingForSessionInfo --fetch ok, > 1 s ahead--> Armed { wake_at }
//! WaitingForSessionInfo --fetch ok, <= 1 s ahead--> PollingFast { baseline }
//! Armed --wake--> PollingFast { baseline }
//! PollingFast --clearing > baseline--> credential check, refresh --> WaitingForSessionInfo
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{SessionClock, time_until};
use crate::models::SessionDescriptor;
use crate::timer::{TaskHandle, WallClock};

/// Period of the fast poll around a clearing.
pub const FAST_POLL_PERIOD: Duration = Duration::from_secs(1);

/// How long before the announced clearing the scheduler wakes.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    WaitingForSessionInfo,
    Armed { wake_at: DateTime<Utc> },
    PollingFast { baseline: DateTime<Utc> },
}

/// Decides what to do with a freshly fetched session.
pub fn plan_after_fetch(session: &SessionDescriptor, now: DateTime<Utc>) -> SchedulerState {
    let clearing = session.clearing_timestamp;
    if time_until(clearing, now) > REFRESH_MARGIN {
        let margin = chrono::Duration::from_std(REFRESH_MARGIN).unwrap_or_default();
        SchedulerState::Armed {
            wake_at: clearing - margin,
        }
    } else {
        SchedulerState::PollingFast { baseline: clearing }
    }
}

/// Work the scheduler triggers at each session boundary.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Whether the credential is still usable.
    async fn credential_valid(&self) -> bool;

    /// Called once when the credential check fails. The scheduler stops
    /// afterwards.
    async fn on_credential_expired(&self);

    /// Full state refresh for the session that just began.
    async fn refresh(&self, session: &SessionDescriptor);
}

pub struct SessionScheduler {
    clock: Arc<SessionClock>,
    wall: Arc<dyn WallClock>,
    hooks: Arc<dyn SessionHooks>,
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    state: watch::Receiver<SchedulerState>,
    generation: Arc<AtomicU64>,
    task: TaskHandle,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the scheduler. A wake already in flight sees the bumped
    /// generation and does nothing.
    pub fn dispose(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.task.dispose();
    }
}

/// Per-run context shared by the loop's helpers.
struct Run {
    token: CancellationToken,
    generation: Arc<AtomicU64>,
    started_at: u64,
    state: watch::Sender<SchedulerState>,
}

impl Run {
    fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.generation.load(Ordering::SeqCst) == self.started_at
    }

    fn publish(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Sleeps for `duration`; `false` if the run was cancelled meanwhile.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.token.cancelled() => false,
            () = tokio::time::sleep(duration) => self.is_current(),
        }
    }
}

impl SessionScheduler {
    pub fn new(clock: Arc<SessionClock>, wall: Arc<dyn WallClock>, hooks: Arc<dyn SessionHooks>) -> Self {
        Self { clock, wall, hooks }
    }

    /// Starts the scheduler on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (state_tx, state_rx) = watch::channel(SchedulerState::WaitingForSessionInfo);
        let generation = Arc::new(AtomicU64::new(0));
        let started_at = generation.load(Ordering::SeqCst);
        let run_generation = Arc::clone(&generation);

        let task = TaskHandle::spawn(move |token| async move {
            let run = Run {
                token,
                generation: run_generation,
                started_at,
                state: state_tx,
            };
            self.run(&run).await;
            debug!("Session scheduler exited");
        });

        SchedulerHandle {
            state: state_rx,
            generation,
            task,
        }
    }

    async fn run(&self, run: &Run) {
        let mut last_refreshed: Option<DateTime<Utc>> = None;

        loop {
            run.publish(SchedulerState::WaitingForSessionInfo);
            let Some(session) = self.clock.fetch_next_session().await else {
                if !run.sleep(FAST_POLL_PERIOD).await {
                    return;
                }
                continue;
            };
            if !run.is_current() {
                return;
            }

            let plan = plan_after_fetch(&session, self.wall.now());
            run.publish(plan);
            if let SchedulerState::Armed { wake_at } = plan {
                debug!(counter = session.counter, %wake_at, "Armed for next clearing");
                if !run.sleep(time_until(wake_at, self.wall.now())).await {
                    return;
                }
            }

            let baseline = session.clearing_timestamp;
            run.publish(SchedulerState::PollingFast { baseline });
            let Some(next) = self.poll_until_advanced(run, baseline).await else {
                return;
            };

            if !self.hooks.credential_valid().await {
                if run.is_current() {
                    info!("Credential expired at session boundary, logging out");
                    self.hooks.on_credential_expired().await;
                }
                return;
            }

            if !run.is_current() {
                return;
            }
            if last_refreshed == Some(baseline) {
                debug!(%baseline, "Refresh already ran for this clearing");
                continue;
            }
            info!(counter = next.counter, "Session advanced, refreshing");
            self.hooks.refresh(&next).await;
            last_refreshed = Some(baseline);
        }
    }

    /// Polls every [`FAST_POLL_PERIOD`] until the exchange reports a
    /// clearing strictly later than `baseline`. `None` if cancelled.
    async fn poll_until_advanced(&self, run: &Run, baseline: DateTime<Utc>) -> Option<SessionDescriptor> {
        loop {
            if !run.sleep(FAST_POLL_PERIOD).await {
                return None;
            }
            match self.clock.fetch_next_session().await {
                Some(next) if next.clearing_timestamp > baseline => {
                    return run.is_current().then_some(next);
                }
                Some(_) => {}
                None => warn!(%baseline, "Fast poll failed, retrying"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(counter: u64, clearing: DateTime<Utc>) -> SessionDescriptor {
        SessionDescriptor {
            counter,
            clearing_timestamp: clearing,
        }
    }

    #[test]
    fn far_clearing_arms_one_second_early() {
        let now = Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap();
        let clearing = now + chrono::Duration::seconds(60);
        assert_eq!(
            plan_after_fetch(&session(1, clearing), now),
            SchedulerState::Armed {
                wake_at: clearing - chrono::Duration::seconds(1)
            }
        );
    }

    #[test]
    fn imminent_or_past_clearing_polls_fast() {
        let now = Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap();
        for offset_ms in [1000, 500, 0, -3000] {
            let clearing = now + chrono::Duration::milliseconds(offset_ms);
            assert_eq!(
                plan_after_fetch(&session(1, clearing), now),
                SchedulerState::PollingFast { baseline: clearing }
            );
        }
    }
}
