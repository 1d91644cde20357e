//! Injectable wall clock. The heuristic and reward rules look at the *local*
//! hour, so time is carried as `DateTime<FixedOffset>`.

use chrono::{DateTime, Duration, FixedOffset, Local, Offset, TimeZone, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let now = Local::now();
        now.with_timezone(now.offset())
    }
}

/// Hand-driven clock for tests and replays.
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 2024-01-01 at `hour`:00 UTC.
    pub fn at_hour(hour: u32) -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, hour.min(23), 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start.with_timezone(&Utc.fix()))
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock();
        *now = *now + Duration::milliseconds(ms);
    }

    pub fn set(&self, at: DateTime<FixedOffset>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock()
    }
}
