use chrono::{
    Datelike, NaiveDateTime, TimeDelta, Timelike,
    format::{DelayedFormat, StrftimeItems},
};
use serde::Serialize;

/// The service's notion of "current time" in the configured zone.
///
/// `timestamp` is the local wall-clock reading (epoch millis) the calendar
/// fields correspond to. Both move together, so a state is never half
/// updated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "ClockFrame")]
pub struct ClockState {
    at: NaiveDateTime,
    timestamp: i64,
}

#[derive(Serialize)]
struct ClockFrame {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    seconds: u32,
    timestamp: i64,
}

impl From<ClockState> for ClockFrame {
    fn from(state: ClockState) -> Self {
        Self {
            year: state.year(),
            month: state.month(),
            day: state.day(),
            hour: state.hour(),
            minute: state.minute(),
            seconds: state.seconds(),
            timestamp: state.timestamp,
        }
    }
}

impl ClockState {
    #[must_use]
    pub const fn synced(at: NaiveDateTime, timestamp: i64) -> Self {
        Self { at, timestamp }
    }

    /// Moves the calendar forward by the whole seconds elapsed between
    /// `timestamp` and `now_millis`. The sub-second remainder stays in
    /// `timestamp` so repeated ticks do not lose time. A wall clock that went
    /// backwards leaves the state unchanged.
    #[must_use]
    pub fn advanced_to(&self, now_millis: i64) -> Self {
        let elapsed_secs = now_millis.saturating_sub(self.timestamp).max(0) / 1000;
        let Some(at) = TimeDelta::try_seconds(elapsed_secs)
            .and_then(|delta| self.at.checked_add_signed(delta))
        else {
            return *self;
        };
        Self {
            at,
            timestamp: self.timestamp + elapsed_secs * 1000,
        }
    }

    #[must_use]
    pub const fn datetime(&self) -> NaiveDateTime {
        self.at
    }

    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn year(&self) -> i32 {
        self.at.year()
    }

    #[must_use]
    pub fn month(&self) -> u32 {
        self.at.month()
    }

    #[must_use]
    pub fn day(&self) -> u32 {
        self.at.day()
    }

    #[must_use]
    pub fn hour(&self) -> u32 {
        self.at.hour()
    }

    #[must_use]
    pub fn minute(&self) -> u32 {
        self.at.minute()
    }

    #[must_use]
    pub fn seconds(&self) -> u32 {
        self.at.second()
    }

    #[must_use]
    pub fn format<'a>(&self, fmt: &'a str) -> DelayedFormat<StrftimeItems<'a>> {
        self.at.format(fmt)
    }

    /// Encodes the state as one server-sent event: `data: <json>\n\n`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialisation fails.
    pub fn sse_frame(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("data: {json}\n\n"))
    }
}
