//! Cron expression handling. Accepts minute- or second-precision
//! expressions (selected at scheduler construction) parsed by the `cron`
//! crate, plus the descriptors `@every <duration>`, `@hourly`, `@daily`.
//!
//! Modeled on the `cron::Schedule` usage in the job-scheduler reference
//! example (`other_examples/0e523b83_…scheduler.rs`), generalized to accept
//! both 5-field (minute-precision) and 6-field (second-precision)
//! expressions by normalizing 5-field input to the `cron` crate's
//! mandatory leading seconds field.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Minute,
    Second,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("invalid @every duration {0:?}: {1}")]
    InvalidDuration(String, String),
}

#[derive(Clone)]
pub enum ScheduleSpec {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl std::fmt::Debug for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron(s) => write!(f, "ScheduleSpec::Cron({s})"),
            Self::Every(d) => write!(f, "ScheduleSpec::Every({d:?})"),
        }
    }
}

impl ScheduleSpec {
    pub fn parse(expr: &str, precision: Precision) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();

        if let Some(rest) = trimmed.strip_prefix("@every ") {
            let dur = parse_duration(rest)
                .map_err(|e| ScheduleError::InvalidDuration(rest.to_string(), e))?;
            return Ok(Self::Every(dur));
        }
        if trimmed == "@hourly" {
            return Ok(Self::Every(Duration::from_secs(3600)));
        }
        if trimmed == "@daily" {
            return Ok(Self::Every(Duration::from_secs(86_400)));
        }

        let normalized = normalize_cron_expr(trimmed, precision);
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| ScheduleError::InvalidCron(trimmed.to_string(), e.to_string()))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// The next tick strictly after `after`, or `None` for a `cron::Schedule`
    /// with no future occurrence (practically never happens, but the `cron`
    /// crate's API is an `Iterator`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&after).next(),
            Self::Every(interval) => {
                let interval = chrono::Duration::from_std(*interval).ok()?;
                Some(after + interval)
            }
        }
    }
}

fn normalize_cron_expr(expr: &str, precision: Precision) -> String {
    let field_count = expr.split_whitespace().count();
    match precision {
        // The `cron` crate always requires a leading seconds field; a
        // standard 5-field UNIX-style expression gets "0 " prepended so it
        // fires once per matching minute at :00 seconds.
        Precision::Minute if field_count == 5 => format!("0 {expr}"),
        _ => expr.to_string(),
    }
}

/// A minimal Go-`time.ParseDuration`-style parser: a sequence of
/// `<number><unit>` pairs (`ms`, `s`, `m`, `h`), e.g. `"1h30m"`, `"500ms"`.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut chars = input.char_indices().peekable();
    let mut start = 0usize;

    while let Some(&(idx, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            chars.next();
            continue;
        }
        // Found the start of a unit suffix; consume number [start, idx).
        let number_str = &input[start..idx];
        if number_str.is_empty() {
            return Err(format!("missing number before unit in {input:?}"));
        }
        let number: f64 = number_str
            .parse()
            .map_err(|_| format!("invalid number {number_str:?}"))?;

        let unit_start = idx;
        let mut unit_end = idx;
        for &(j, uc) in chars.clone().collect::<Vec<_>>().iter() {
            if uc.is_ascii_digit() || uc == '.' {
                break;
            }
            unit_end = j + uc.len_utf8();
            chars.next();
        }
        let unit = &input[unit_start..unit_end];
        let unit_nanos: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60_000_000_000.0,
            "h" => 3_600_000_000_000.0,
            other => return Err(format!("unknown duration unit {other:?}")),
        };
        total += Duration::from_nanos((number * unit_nanos) as u64);
        start = unit_end;
    }

    if start != input.len() {
        return Err(format!("trailing characters in duration {input:?}"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_hourly_daily_descriptors() {
        assert!(matches!(
            ScheduleSpec::parse("@hourly", Precision::Second).unwrap(),
            ScheduleSpec::Every(d) if d == Duration::from_secs(3600)
        ));
        assert!(matches!(
            ScheduleSpec::parse("@daily", Precision::Second).unwrap(),
            ScheduleSpec::Every(d) if d == Duration::from_secs(86_400)
        ));
        assert!(matches!(
            ScheduleSpec::parse("@every 1h30m", Precision::Second).unwrap(),
            ScheduleSpec::Every(d) if d == Duration::from_secs(5400)
        ));
    }

    #[test]
    fn parses_five_field_minute_precision_expression() {
        let schedule = ScheduleSpec::parse("*/5 * * * *", Precision::Minute).unwrap();
        assert!(matches!(schedule, ScheduleSpec::Cron(_)));
    }

    #[test]
    fn parses_six_field_second_precision_expression() {
        let schedule = ScheduleSpec::parse("*/10 * * * * *", Precision::Second).unwrap();
        assert!(matches!(schedule, ScheduleSpec::Cron(_)));
    }

    #[test]
    fn rejects_garbage_expression() {
        assert!(ScheduleSpec::parse("not a cron expr", Precision::Second).is_err());
    }

    #[test]
    fn every_duration_parser_handles_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    }
}
