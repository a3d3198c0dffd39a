//! Cron schedule evaluation for scheduled runs.
//!
//! A pure function over epoch seconds: the next fire time is the minimum
//! across all configured cron expressions, strictly after the given
//! instant. No side effects, no clock reads.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::warn;

/// Next fire time (epoch seconds) strictly after `after`, across all
/// expressions. None when no expression parses or none ever fires again.
pub fn next_fire_time(crons: &[String], after: u64) -> Option<u64> {
    let after = DateTime::<Utc>::from_timestamp(i64::try_from(after).ok()?, 0)?;
    crons
        .iter()
        .filter_map(|expr| match parse_cron(expr) {
            Some(schedule) => schedule.after(&after).next(),
            None => {
                warn!(expr = %expr, "invalid cron expression ignored");
                None
            }
        })
        .map(|fire| fire.timestamp().max(0) as u64)
        .min()
}

/// Parse a cron expression, accepting the five-field form by prepending a
/// seconds field.
fn parse_cron(expr: &str) -> Option<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).ok()
}
