//! Quiet-hours arithmetic in the recipient's own time zone.
//!
//! The window is `[start_hour, end_hour)` local time and may wrap midnight
//! (22 -> 8). `start == end` means no quiet hours. All inputs are explicit
//! UTC instants plus an IANA zone; the process-local clock is never consulted.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    pub fn new(start_hour: u8, end_hour: u8) -> Result<Self, AppError> {
        if start_hour > 23 || end_hour > 23 {
            return Err(AppError::Validation(format!(
                "quiet hours must be within 0-23, got {}-{}",
                start_hour, end_hour
            )));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.start_hour == self.end_hour
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start_hour > self.end_hour
    }

    /// Whether a local wall-clock hour falls inside the window.
    pub fn contains_hour(&self, hour: u32) -> bool {
        let (start, end) = (u32::from(self.start_hour), u32::from(self.end_hour));
        if self.is_empty() {
            false
        } else if self.wraps_midnight() {
            hour >= start || hour < end
        } else {
            hour >= start && hour < end
        }
    }

    /// Whether `now` is inside quiet hours for a recipient in `tz`.
    pub fn contains(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.contains_hour(now.with_timezone(&tz).hour())
    }

    /// The first local `end_hour:00` strictly after `now`, as a UTC instant.
    pub fn next_end(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let end = NaiveTime::from_hms_opt(u32::from(self.end_hour), 0, 0).unwrap_or(NaiveTime::MIN);
        let mut date = now.with_timezone(&tz).date_naive();

        for _ in 0..3 {
            let candidate = resolve_local(tz, date.and_time(end));
            if candidate > now {
                return candidate;
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        now + Duration::hours(24)
    }
}

/// Map a local wall-clock time to UTC, taking the earlier instant when the
/// time is ambiguous and skipping forward over DST gaps.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&naive),
            }
        }
    }
}
