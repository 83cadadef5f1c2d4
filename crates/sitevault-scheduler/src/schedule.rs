use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{BackupType, Frequency, NewSchedule, ScheduleTiming};

/// Compute the next UTC execution time for `timing` strictly after `now`.
///
/// Pure: the same `(timing, now)` always yields the same instant. A slot equal
/// to `now` counts as the firing currently being processed, so it is skipped.
pub fn compute_next_run(timing: &ScheduleTiming, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    validate_timing(timing)?;
    let hour = timing.hour_of_day as u32;
    let minute = timing.minute_of_hour as u32;

    match timing.frequency {
        Frequency::Hourly => {
            let candidate = at(now.date_naive(), now.hour(), minute)?;
            if candidate > now {
                Ok(candidate)
            } else {
                Ok(candidate + Duration::hours(1))
            }
        }

        Frequency::Daily => {
            let candidate = at(now.date_naive(), hour, minute)?;
            if candidate > now {
                Ok(candidate)
            } else {
                Ok(candidate + Duration::days(1))
            }
        }

        Frequency::Weekly => {
            // validate_timing guarantees the day is present for weekly.
            let target = timing.day_of_week.unwrap_or_default() as u32;
            let today = now.date_naive();
            // Today plus seven more days covers "today, but the slot passed".
            for offset in 0..=7u64 {
                let day = today
                    .checked_add_days(Days::new(offset))
                    .ok_or_else(|| out_of_range(now))?;
                if day.weekday().num_days_from_sunday() != target {
                    continue;
                }
                let candidate = at(day, hour, minute)?;
                if candidate > now {
                    return Ok(candidate);
                }
            }
            Err(out_of_range(now))
        }

        Frequency::Monthly => {
            let this_month = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .ok_or_else(|| out_of_range(now))?;
            let candidate = at(this_month, hour, minute)?;
            if candidate > now {
                return Ok(candidate);
            }
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            let next_month =
                NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| out_of_range(now))?;
            at(next_month, hour, minute)
        }
    }
}

fn at(day: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
    let naive = day.and_hms_opt(hour, minute, 0).ok_or_else(|| {
        SchedulerError::Validation(format!("invalid time of day {hour:02}:{minute:02}"))
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn out_of_range(now: DateTime<Utc>) -> SchedulerError {
    SchedulerError::Validation(format!("no run time representable after {now}"))
}

/// Check the time-of-day fields the frequency actually reads: `hour_of_day`
/// is ignored for hourly, `day_of_week` for everything but weekly.
pub fn validate_timing(timing: &ScheduleTiming) -> Result<()> {
    let timing = normalize_timing(*timing);
    if timing.hour_of_day > 23 {
        return Err(SchedulerError::Validation(format!(
            "hour_of_day must be 0-23, got {}",
            timing.hour_of_day
        )));
    }
    if timing.minute_of_hour > 59 {
        return Err(SchedulerError::Validation(format!(
            "minute_of_hour must be 0-59, got {}",
            timing.minute_of_hour
        )));
    }
    if timing.frequency == Frequency::Weekly {
        match timing.day_of_week {
            None => {
                return Err(SchedulerError::Validation(
                    "weekly schedule requires day_of_week".to_string(),
                ))
            }
            Some(d) if d > 6 => {
                return Err(SchedulerError::Validation(format!(
                    "day_of_week must be 0-6, got {d}"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Validate a schedule before it is stored.
pub fn validate_new_schedule(input: &NewSchedule) -> Result<()> {
    validate_timing(&input.timing)?;
    if input.full_backup_frequency == Some(0) {
        return Err(SchedulerError::Validation(
            "full_backup_frequency must be a positive integer".to_string(),
        ));
    }
    if input.retention_count == Some(0) {
        return Err(SchedulerError::Validation(
            "retention_count must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

/// Drop fields the frequency does not read, so stored rows stay canonical.
pub fn normalize_timing(timing: ScheduleTiming) -> ScheduleTiming {
    match timing.frequency {
        Frequency::Weekly => timing,
        Frequency::Hourly => ScheduleTiming {
            day_of_week: None,
            hour_of_day: 0,
            ..timing
        },
        Frequency::Daily | Frequency::Monthly => ScheduleTiming {
            day_of_week: None,
            ..timing
        },
    }
}

/// True when `full_backup_frequency` is set but can never apply.
pub fn full_frequency_is_inert(input: &NewSchedule) -> bool {
    input.backup_type == BackupType::Full && input.full_backup_frequency.is_some()
}
