use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use tally_core::Clock;

use crate::ReconError;

/// Five-field cron expression (minute, hour, day-of-month, month,
/// day-of-week) supporting `*`, `*/step`, numbers, ranges and lists.
/// Day-of-month and day-of-week OR together when both are restricted, as
/// in classic cron.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ReconError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ReconError::InvalidCron(format!(
                "expected 5 fields, got {} in '{expr}'",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        // 0 and 7 both mean Sunday.
        let days_of_week = parse_field(fields[4], 0, 7)?
            .into_iter()
            .map(|d| if d == 7 { 0 } else { d })
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(CronSchedule {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        if !self.minutes.contains(&t.minute())
            || !self.hours.contains(&t.hour())
            || !self.months.contains(&t.month())
        {
            return false;
        }

        let dom_hit = self.days_of_month.contains(&t.day());
        let dow_hit = self.days_of_week.contains(&t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    /// The first matching minute strictly after `after`. Bounded scan; a
    /// satisfiable expression always fires within 366 days.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let limit = after + Duration::days(366);
        while candidate <= limit {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, ReconError> {
    let mut values = std::collections::BTreeSet::new();

    for part in field.split(',') {
        if part == "*" {
            values.extend(min..=max);
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| ReconError::InvalidCron(format!("bad step in '{field}'")))?;
            if step == 0 {
                return Err(ReconError::InvalidCron(format!("zero step in '{field}'")));
            }
            values.extend((min..=max).filter(|v| (v - min) % step == 0));
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .parse()
                .map_err(|_| ReconError::InvalidCron(format!("bad range in '{field}'")))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| ReconError::InvalidCron(format!("bad range in '{field}'")))?;
            if lo < min || hi > max || lo > hi {
                return Err(ReconError::InvalidCron(format!(
                    "range {lo}-{hi} outside {min}..={max}"
                )));
            }
            values.extend(lo..=hi);
        } else {
            let value: u32 = part
                .parse()
                .map_err(|_| ReconError::InvalidCron(format!("bad value '{part}' in '{field}'")))?;
            if value < min || value > max {
                return Err(ReconError::InvalidCron(format!(
                    "value {value} outside {min}..={max}"
                )));
            }
            values.insert(value);
        }
    }

    Ok(values.into_iter().collect())
}

/// Drives the reconciliation cadence: cron-scheduled batch runs plus the
/// daily digest at a fixed local hour. Shuts down cleanly when the watch
/// channel flips.
pub struct Scheduler {
    schedule: CronSchedule,
    digest_hour: u32,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(cron_expr: &str, digest_hour: u32, clock: Arc<dyn Clock>) -> Result<Self, ReconError> {
        Ok(Self {
            schedule: CronSchedule::parse(cron_expr)?,
            digest_hour,
            clock,
        })
    }

    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(after)
    }

    /// Next occurrence of the digest hour in local time.
    pub fn next_digest_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local = after.with_timezone(&Local);
        let mut day = local.date_naive();
        loop {
            if let Some(candidate) = day
                .and_hms_opt(self.digest_hour, 0, 0)
                .and_then(|naive| Local.from_local_datetime(&naive).single())
            {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > after {
                    return candidate;
                }
            }
            day += Duration::days(1);
        }
    }

    /// Run until shutdown, invoking `on_run` at each cron tick and
    /// `on_digest` at the digest hour.
    pub async fn run<R, RF, D, DF>(
        &self,
        mut on_run: R,
        mut on_digest: D,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: FnMut() -> RF,
        RF: Future<Output = ()>,
        D: FnMut() -> DF,
        DF: Future<Output = ()>,
    {
        loop {
            let now = self.clock.now();
            let next_run = self.next_run_after(now);
            let next_digest = self.next_digest_after(now);

            let (wake_at, is_digest) = match next_run {
                Some(run) if run <= next_digest => (run, false),
                _ => (next_digest, true),
            };

            let sleep = (wake_at - now).to_std().unwrap_or_default();
            tracing::debug!(?wake_at, is_digest, "scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    if is_digest {
                        on_digest().await;
                    } else {
                        on_run().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_three_hours() {
        let schedule = CronSchedule::parse("0 */3 * * *").unwrap();
        let next = schedule.next_after(at(2025, 3, 10, 1, 30)).unwrap();
        assert_eq!(next, at(2025, 3, 10, 3, 0));
        let next = schedule.next_after(next).unwrap();
        assert_eq!(next, at(2025, 3, 10, 6, 0));
    }

    #[test]
    fn exact_minute_and_hour() {
        let schedule = CronSchedule::parse("30 6 * * *").unwrap();
        let next = schedule.next_after(at(2025, 3, 10, 6, 30)).unwrap();
        // Strictly after: same day's fire time has passed.
        assert_eq!(next, at(2025, 3, 11, 6, 30));
    }

    #[test]
    fn day_of_week_restriction() {
        // 2025-03-10 is a Monday; next Friday run is 2025-03-14.
        let schedule = CronSchedule::parse("0 9 * * 5").unwrap();
        let next = schedule.next_after(at(2025, 3, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 14, 9, 0));
    }

    #[test]
    fn sunday_as_seven() {
        let schedule = CronSchedule::parse("0 0 * * 7").unwrap();
        let next = schedule.next_after(at(2025, 3, 10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn lists_and_ranges() {
        let schedule = CronSchedule::parse("0,30 8-10 * * *").unwrap();
        let next = schedule.next_after(at(2025, 3, 10, 8, 0)).unwrap();
        assert_eq!(next, at(2025, 3, 10, 8, 30));
        let next = schedule.next_after(at(2025, 3, 10, 10, 30)).unwrap();
        assert_eq!(next, at(2025, 3, 11, 8, 0));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronSchedule::parse("0 * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
    }
}
