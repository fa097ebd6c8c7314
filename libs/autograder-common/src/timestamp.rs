// Millisecond-precision instants.
use anyhow::{bail, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

pub const MSECS_PER_SECS: i64 = 1000;
pub const MSECS_PER_MINS: i64 = MSECS_PER_SECS * 60;
pub const MSECS_PER_HOURS: i64 = MSECS_PER_MINS * 60;
pub const MSECS_PER_DAYS: i64 = MSECS_PER_HOURS * 24;

const UNIXTIME_THRESHOLD_SECS: i64 = 10_000_000_000;
const UNIXTIME_THRESHOLD_MSECS: i64 = 10_000_000_000_000;
const UNIXTIME_THRESHOLD_USECS: i64 = 10_000_000_000_000_000;

/// Signed count of milliseconds since the Unix epoch.
/// Serializes as a bare integer; zero is the "unset" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub const fn zero() -> Self {
        Timestamp(0)
    }

    pub const fn from_msecs(msecs: i64) -> Self {
        Timestamp(msecs)
    }

    pub fn from_datetime<Tz: TimeZone>(instance: &DateTime<Tz>) -> Self {
        Timestamp(instance.timestamp_millis())
    }

    /// Interpret a bare integer of unknown unit (secs, msecs, usecs, or nsecs) by its magnitude.
    pub fn guess_from_i64(value: i64) -> Self {
        if value < UNIXTIME_THRESHOLD_SECS {
            Timestamp(value * MSECS_PER_SECS)
        } else if value < UNIXTIME_THRESHOLD_MSECS {
            Timestamp(value)
        } else if value < UNIXTIME_THRESHOLD_USECS {
            Timestamp(value / 1000)
        } else {
            Timestamp(value / 1000 / 1000)
        }
    }

    /// Parse an integer (see `guess_from_i64`) or one of the common date formats.
    /// Formats without an offset are read in local time.
    pub fn guess_from_str(text: &str) -> Result<Self> {
        let text = text.trim();

        if let Ok(value) = text.parse::<i64>() {
            return Ok(Self::guess_from_i64(value));
        }

        if let Ok(instance) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::from_datetime(&instance));
        }

        if let Ok(instance) = DateTime::parse_from_rfc2822(text) {
            return Ok(Self::from_datetime(&instance));
        }

        for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%a %b %e %H:%M:%S %Y"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                if let Some(instance) = Local.from_local_datetime(&naive).earliest() {
                    return Ok(Self::from_datetime(&instance));
                }
            }
        }

        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(instance) = date
                .and_hms_opt(0, 0, 0)
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            {
                return Ok(Self::from_datetime(&instance));
            }
        }

        bail!("Could not guess time '{}'", text)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_msecs(&self) -> i64 {
        self.0
    }

    pub fn to_secs(&self) -> f64 {
        self.0 as f64 / MSECS_PER_SECS as f64
    }

    pub fn to_mins(&self) -> f64 {
        self.0 as f64 / MSECS_PER_MINS as f64
    }

    pub fn to_hours(&self) -> f64 {
        self.0 as f64 / MSECS_PER_HOURS as f64
    }

    pub fn to_days(&self) -> f64 {
        self.0 as f64 / MSECS_PER_DAYS as f64
    }

    pub fn to_local(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.0).single()
    }

    /// RFC3339 in the server's local time.
    pub fn safe_string(&self) -> String {
        match self.to_local() {
            Some(instance) => instance.to_rfc3339_opts(SecondsFormat::Millis, false),
            None => self.safe_message(),
        }
    }

    /// Machine-recoverable rendering for embedding into free text: `<timestamp:N>`.
    pub fn safe_message(&self) -> String {
        format!("<timestamp:{}>", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.safe_string())
    }
}

impl From<i64> for Timestamp {
    fn from(msecs: i64) -> Self {
        Timestamp(msecs)
    }
}

impl Add<i64> for Timestamp {
    type Output = Timestamp;

    fn add(self, msecs: i64) -> Timestamp {
        Timestamp(self.0 + msecs)
    }
}

impl Sub<i64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, msecs: i64) -> Timestamp {
        Timestamp(self.0 - msecs)
    }
}

/// Difference in milliseconds.
impl Sub<Timestamp> for Timestamp {
    type Output = i64;

    fn sub(self, other: Timestamp) -> i64 {
        self.0 - other.0
    }
}
