//! Next-fire computation for the three schedule kinds.

use std::str::FromStr;

use chrono::{DateTime, Local, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use super::types::{JobState, Schedule};
use crate::error::{KeeperError, Result};

/// Compute the next run instant for a job, in epoch milliseconds.
///
/// Returns None for terminal schedules (a one-shot that already ran, or
/// an unparsable cron expression).
pub fn next_run_at(
    schedule: &Schedule,
    state: &JobState,
    created_at_ms: i64,
    now_ms: i64,
) -> Option<i64> {
    match schedule {
        Schedule::At { at_ms } => {
            // A past target that never ran fires immediately; after one
            // run the schedule is terminal.
            if state.last_run_at_ms.is_none() {
                Some(*at_ms)
            } else {
                None
            }
        }
        Schedule::Every { every_ms } => {
            if *every_ms <= 0 {
                return None;
            }
            match state.last_run_at_ms {
                None => Some(created_at_ms + every_ms),
                Some(last_run) => {
                    // Catch up by whole periods until strictly in the future
                    let mut next = last_run + every_ms;
                    while next <= now_ms {
                        next += every_ms;
                    }
                    Some(next)
                }
            }
        }
        Schedule::Cron { expr, tz } => match next_cron_fire(expr, tz.as_deref(), now_ms) {
            Ok(next) => next,
            Err(e) => {
                warn!(expr = %expr, "cron schedule not evaluable: {e}");
                None
            }
        },
    }
}

/// Parse a standard 5-field cron expression.
///
/// The underlying parser wants a seconds field, so one is prepended.
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        return Err(KeeperError::Validation(format!(
            "cron expression must have 5 fields, got {fields}: {expr:?}"
        )));
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| KeeperError::Validation(format!("invalid cron expression {expr:?}: {e}")))
}

fn next_cron_fire(expr: &str, tz: Option<&str>, now_ms: i64) -> Result<Option<i64>> {
    let schedule = parse_cron_expr(expr)?;
    let now: DateTime<Utc> = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .ok_or_else(|| KeeperError::Validation(format!("invalid timestamp: {now_ms}")))?;

    let next = match tz {
        Some(name) => {
            let zone = Tz::from_str(name)
                .map_err(|_| KeeperError::Validation(format!("unknown timezone: {name:?}")))?;
            schedule
                .after(&now.with_timezone(&zone))
                .next()
                .map(|dt| dt.timestamp_millis())
        }
        None => schedule
            .after(&now.with_timezone(&Local))
            .next()
            .map(|dt| dt.timestamp_millis()),
    };

    Ok(next)
}
