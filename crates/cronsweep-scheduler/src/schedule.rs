use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};

use crate::{
    error::{Result, SchedulerError},
    types::Schedule,
};

/// Compute the next UTC execution time for `schedule` strictly after `from`.
///
/// Returns `None` when the schedule is exhausted (a `Once` job whose instant
/// is not in the future) or when the schedule fields are out of range.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => from.checked_add_signed(interval(*every_secs)?),

        Schedule::Daily { hour, minute } => {
            let candidate = at_time_of_day(from, *hour, *minute)?;
            if candidate > from {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(1))
            }
        }

        Schedule::Weekly { day, hour, minute } => {
            if *day > 6 {
                return None;
            }
            let today = from.weekday().num_days_from_monday() as i64;
            let ahead = (*day as i64 - today).rem_euclid(7);
            let candidate =
                at_time_of_day(from, *hour, *minute)?.checked_add_signed(Duration::days(ahead))?;
            if candidate > from {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(7))
            }
        }
    }
}

/// Reject schedules that can never fire.
pub fn validate(schedule: &Schedule) -> Result<()> {
    let ok = match schedule {
        Schedule::Once { .. } => true,
        Schedule::Interval { every_secs } => interval(*every_secs)
            .and_then(|step| Utc::now().checked_add_signed(step))
            .is_some(),
        Schedule::Daily { hour, minute } => *hour < 24 && *minute < 60,
        Schedule::Weekly { day, hour, minute } => *day <= 6 && *hour < 24 && *minute < 60,
    };
    if ok {
        Ok(())
    } else {
        Err(SchedulerError::InvalidSchedule(format!("{schedule:?}")))
    }
}

/// A positive interval that chrono can represent.
fn interval(every_secs: u64) -> Option<Duration> {
    let secs = i64::try_from(every_secs).ok().filter(|s| *s > 0)?;
    Duration::try_seconds(secs)
}

/// `from`'s date at HH:MM:00 UTC.
fn at_time_of_day(from: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)?;
    Some(from.date_naive().and_time(time).and_utc())
}
