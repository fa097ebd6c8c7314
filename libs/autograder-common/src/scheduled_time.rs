// Recurring schedules: a fixed period ("every") or a local time of day ("daily").
use crate::timestamp::{Timestamp, MSECS_PER_DAYS, MSECS_PER_HOURS, MSECS_PER_MINS, MSECS_PER_SECS};
use anyhow::{bail, Context, Result};
use chrono::{Days, Local, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSpec {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub days: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hours: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minutes: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seconds: i64,

    // Test-only resolution, not part of the JSON form.
    #[serde(skip)]
    pub milliseconds: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl DurationSpec {
    pub fn validate(&self) -> Result<()> {
        let components = [
            ("days", self.days),
            ("hours", self.hours),
            ("minutes", self.minutes),
            ("seconds", self.seconds),
            ("milliseconds", self.milliseconds),
        ];

        for (name, value) in components {
            if value < 0 {
                bail!("Duration cannot have negative {}, found '{}'", name, value);
            }
        }

        if self.checked_total_msecs().is_none() {
            bail!("Duration is too large and has overflowed");
        }

        Ok(())
    }

    fn checked_total_msecs(&self) -> Option<i64> {
        let parts = [
            self.days.checked_mul(MSECS_PER_DAYS)?,
            self.hours.checked_mul(MSECS_PER_HOURS)?,
            self.minutes.checked_mul(MSECS_PER_MINS)?,
            self.seconds.checked_mul(MSECS_PER_SECS)?,
            self.milliseconds,
        ];

        parts.iter().try_fold(0i64, |total, part| total.checked_add(*part))
    }

    pub fn total_msecs(&self) -> i64 {
        self.checked_total_msecs().unwrap_or(i64::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.total_msecs() == 0
    }

    pub fn compute_next_time(&self, start: Timestamp) -> Timestamp {
        start + self.total_msecs()
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "every {} days, {} hours, {} minutes, {} seconds; ({} total seconds)",
            self.days,
            self.hours,
            self.minutes,
            self.seconds,
            self.total_msecs() / MSECS_PER_SECS
        )
    }
}

/// A 24-hour local time of day, "HH:MM" or "HH:MM:SS".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeOfDaySpec(pub String);

impl TimeOfDaySpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        self.parse().map(|_| ())
    }

    fn parse(&self) -> Result<NaiveTime> {
        let text = if self.0.is_empty() { "00:00:00" } else { self.0.as_str() };

        let layout = match text.matches(':').count() {
            1 => "%H:%M",
            2 => "%H:%M:%S",
            _ => bail!("Time of day does not look like a 24-hour time: '{}'", text),
        };

        NaiveTime::parse_from_str(text, layout)
            .with_context(|| format!("Could not parse time of day from '{}', looking for 24-hour time", text))
    }

    /// The first instant at this time of day that is not before `start`, in local time.
    pub fn compute_next_time(&self, start: Timestamp) -> Timestamp {
        let time_of_day = match self.parse() {
            Ok(time_of_day) => time_of_day,
            Err(e) => {
                tracing::error!(contents = %self.0, error = %e, "Failed to parse time of day spec");
                NaiveTime::MIN
            }
        };

        let start_local = match start.to_local() {
            Some(instance) => instance,
            None => return start,
        };

        let mut date = start_local.date_naive();
        loop {
            let candidate = Local
                .from_local_datetime(&date.and_time(time_of_day))
                .earliest()
                .map(|instance| Timestamp::from_datetime(&instance));

            if let Some(candidate) = candidate {
                if candidate >= start {
                    return candidate;
                }
            }

            date = match date.checked_add_days(Days::new(1)) {
                Some(next) => next,
                None => return start,
            };
        }
    }
}

impl fmt::Display for TimeOfDaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time_of_day = self.parse().unwrap_or(NaiveTime::MIN);
        write!(f, "daily at {}", time_of_day.format("%H:%M:%S"))
    }
}

/// Always call `validate` after construction; the other methods assume a valid value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTime {
    #[serde(default, skip_serializing_if = "DurationSpec::is_empty")]
    pub every: DurationSpec,
    #[serde(default, skip_serializing_if = "TimeOfDaySpec::is_empty")]
    pub daily: TimeOfDaySpec,
}

impl ScheduledTime {
    pub fn validate(&self) -> Result<()> {
        self.daily
            .validate()
            .context("Schedule time 'daily' component is invalid")?;
        self.every
            .validate()
            .context("Schedule time 'every' component is invalid")?;

        match (self.daily.is_empty(), self.every.is_empty()) {
            (true, true) => bail!("Both 'daily' and 'every' cannot be empty"),
            (false, false) => bail!("Both 'daily' and 'every' cannot be populated"),
            _ => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.daily.is_empty() && self.every.is_empty()
    }

    pub fn total_msecs(&self) -> i64 {
        if self.daily.is_empty() {
            self.every.total_msecs()
        } else {
            MSECS_PER_DAYS
        }
    }

    pub fn compute_next_time(&self, start: Timestamp) -> Timestamp {
        if self.daily.is_empty() {
            self.every.compute_next_time(start)
        } else {
            self.daily.compute_next_time(start)
        }
    }

    pub fn compute_next_time_from_now(&self) -> Timestamp {
        self.compute_next_time(Timestamp::now())
    }
}

impl fmt::Display for ScheduledTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.daily.is_empty() {
            write!(f, "{}", self.every)
        } else {
            write!(f, "{}", self.daily)
        }
    }
}
