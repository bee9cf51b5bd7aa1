use std::str::FromStr;
use std::time::Duration;

use bizflow_core::{Error, Result};
use chrono::{DateTime, Utc};

/// A parsed `Schedule` trigger expression.
///
/// Accepts standard 5-field cron (a `0` seconds field is prepended and the
/// day-of-week field is translated to day names), the 6/7-field form
/// understood by the `cron` crate, or `every <n><s|m|h|d>`.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        let invalid = |reason: &str| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = expr.strip_prefix("every ") {
            return parse_every(rest.trim())
                .map(Schedule::Every)
                .ok_or_else(|| invalid("expected every <n><s|m|h|d>, at most 365 days"));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let full = match fields.len() {
            5 => {
                let days = standard_day_of_week(fields[4])
                    .ok_or_else(|| invalid("invalid day-of-week field"))?;
                format!("0 {} {}", fields[..4].join(" "), days)
            }
            6 | 7 => expr.to_string(),
            0 => return Err(invalid("empty expression")),
            _ => return Err(invalid("expected 5, 6 or 7 cron fields")),
        };
        cron::Schedule::from_str(&full)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| invalid(&e.to_string()))
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&now).next(),
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                now.checked_add_signed(step)
            }
        }
    }

    /// How long to sleep from `now` until the next fire time.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

const MAX_EVERY_SECS: u64 = 365 * 86_400;

fn parse_every(spec: &str) -> Option<Duration> {
    let unit_at = spec.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = spec.split_at(unit_at);
    let n: u64 = num.parse().ok()?;
    if n == 0 {
        return None;
    }
    let per_unit = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    let secs = n.checked_mul(per_unit).filter(|s| *s <= MAX_EVERY_SECS)?;
    Some(Duration::from_secs(secs))
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a standard cron day-of-week field (0-7, Sunday is 0 or 7) as the
/// day names the `cron` crate reads, which numbers days 1-7 from Sunday.
/// Items that are already names pass through.
fn standard_day_of_week(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_string());
    }
    let mut out: Vec<String> = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
            None => (item, None),
        };
        let (lo, hi) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?),
                None => {
                    let a = range.parse::<usize>().ok()?;
                    (a, if step.is_some() { 6 } else { a })
                }
            },
        };
        if hi > 7 || lo > hi {
            return None;
        }
        for day in (lo..=hi).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[day % 7].to_string();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    Some(out.join(","))
}
