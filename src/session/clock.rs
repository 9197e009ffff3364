//! Holds the exchange's next clearing session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clients::ExchangeClient;
use crate::models::SessionDescriptor;

/// Fetches and remembers the next clearing session.
pub struct SessionClock {
    exchange: Arc<dyn ExchangeClient>,
    latest: Mutex<Option<SessionDescriptor>>,
}

impl SessionClock {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            exchange,
            latest: Mutex::new(None),
        }
    }

    /// One round trip to the exchange. A failure is logged and yields
    /// `None`; the previous descriptor stays in place.
    pub async fn fetch_next_session(&self) -> Option<SessionDescriptor> {
        match self.exchange.query_next_session().await {
            Ok(session) => {
                debug!(
                    counter = session.counter,
                    clearing = %session.clearing_timestamp,
                    "Fetched next session"
                );
                *self.latest.lock() = Some(session);
                Some(session)
            }
            Err(e) => {
                warn!("Failed to fetch next session: {e}");
                None
            }
        }
    }

    pub fn latest(&self) -> Option<SessionDescriptor> {
        *self.latest.lock()
    }

    pub fn latest_clearing(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|s| s.clearing_timestamp)
    }
}

/// Time from `now` until `clearing`, zero if it already passed.
pub fn time_until(clearing: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (clearing - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_until_saturates_at_zero() {
        let now = Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap();
        let later = now + chrono::Duration::milliseconds(2500);
        assert_eq!(time_until(later, now), Duration::from_millis(2500));
        assert_eq!(time_until(now, later), Duration::ZERO);
        assert_eq!(time_until(now, now), Duration::ZERO);
    }
}
