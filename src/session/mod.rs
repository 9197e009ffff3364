//! Session clock and the scheduler aligned to it.

pub mod clock;
pub mod scheduler;

pub use clock::{SessionClock, time_until};
pub use scheduler::{
    FAST_POLL_PERIOD, REFRESH_MARGIN, SchedulerHandle, SchedulerState, SessionHooks,
    SessionScheduler, plan_after_fetch,
};
