//! Wall clock for the cron engine.
//!
//! Schedules speak in wall time (`DateTime<Utc>`) while sleeping happens on
//! the Tokio timer. The clock anchors one wall reading to one Tokio instant and
//! derives every later reading from the monotonic offset, so the two never
//! disagree and a paused Tokio runtime drives the engine deterministically.

use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    base: Instant,
}

impl Clock {
    /// Clock anchored to the current system time.
    pub fn system() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock whose current reading is `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            base: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.base);
        self.wall + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    /// Tokio deadline corresponding to a wall time. Past times map to "now".
    pub fn deadline(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.wall).to_std().unwrap_or(Duration::ZERO);
        std::cmp::max(self.base + offset, Instant::now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Clock::starting_at(start);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_for_past_time_is_now() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Clock::starting_at(start);

        let past = start - chrono::Duration::seconds(5);
        assert_eq!(clock.deadline(past), Instant::now());

        let future = start + chrono::Duration::seconds(5);
        assert_eq!(clock.deadline(future), Instant::now() + Duration::from_secs(5));
    }
}
