use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use dotclaw_core::timeparse::parse_scheduled_timestamp;

use crate::error::{Result, SchedulerError};
use crate::types::ScheduleSpec;

/// Compute the next UTC fire time for `spec` strictly after `from`.
///
/// Returns `Ok(None)` when the schedule is exhausted — a `Once` whose
/// instant has passed, or a cron expression with no future fire. The task
/// completes in that case.
pub fn compute_next_run(
    spec: &ScheduleSpec,
    tz: Tz,
    from: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    match spec {
        ScheduleSpec::Once(at) => {
            let instant = parse_scheduled_timestamp(at, tz)
                .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
            Ok((instant > from).then_some(instant))
        }

        ScheduleSpec::Interval(every_ms) => {
            if *every_ms <= 0 {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "non-positive interval: {every_ms}"
                )));
            }
            let base = last_run.unwrap_or(from);
            let mut next = base + Duration::milliseconds(*every_ms);
            // A long outage skips straight to the next future slot instead of
            // replaying every missed interval.
            if next <= from {
                next = from + Duration::milliseconds(*every_ms);
            }
            Ok(Some(next))
        }

        ScheduleSpec::Cron(expr) => {
            let schedule = cron::Schedule::from_str(expr)
                .map_err(|e| SchedulerError::InvalidSchedule(format!("{expr}: {e}")))?;
            let local = from.with_timezone(&tz);
            Ok(schedule
                .after(&local)
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
    }
}
