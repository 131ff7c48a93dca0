//! One shared deadline multiplexed over every registered job.
//!
//! Times are naive local wall-clock values. Cron expressions are evaluated
//! against that wall clock as-is (no DST adjustment), which keeps fire times
//! deterministic and identical to what `LAST_UPDATE_DATETIME` records.

use chrono::{Months, NaiveDateTime, TimeDelta, TimeZone, Utc};
use cron::Schedule;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid interval '{0}': expected <count><h|d|w|m> with count > 0")]
    InvalidInterval(String),
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("schedule '{0}' has no upcoming fire time")]
    NeverFires(String),
    #[error("job already registered: {0}")]
    DuplicateJob(String),
    #[error("job not found: {0}")]
    UnknownJob(String),
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Hours(u32),
    Days(u32),
    Weeks(u32),
    /// Calendar months: the same day-of-month `n` months on, clamped to the
    /// last day of shorter months.
    Months(u32),
}

impl Interval {
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidInterval(spec.to_string());
        let trimmed = spec.trim();
        let unit = trimmed.chars().last().ok_or_else(invalid)?;
        let digits = &trimmed[..trimmed.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let count: u32 = digits.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }
        match unit {
            'h' => Ok(Interval::Hours(count)),
            'd' => Ok(Interval::Days(count)),
            'w' => Ok(Interval::Weeks(count)),
            'm' => Ok(Interval::Months(count)),
            _ => Err(invalid()),
        }
    }

    /// `origin + k * self`. Each step is measured from `origin` rather than
    /// from the previous step, so month clamping never accumulates.
    pub fn nth_after(&self, origin: NaiveDateTime, k: u32) -> Option<NaiveDateTime> {
        let steps = |n: u32| i64::from(n).checked_mul(i64::from(k));
        match *self {
            Interval::Hours(n) => origin.checked_add_signed(TimeDelta::try_hours(steps(n)?)?),
            Interval::Days(n) => origin.checked_add_signed(TimeDelta::try_days(steps(n)?)?),
            Interval::Weeks(n) => origin.checked_add_signed(TimeDelta::try_weeks(steps(n)?)?),
            Interval::Months(n) => {
                let months = u32::try_from(steps(n)?).ok()?;
                origin.checked_add_months(Months::new(months))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

pub fn parse_cron_expression(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    // The `cron` crate wants 6 or 7 fields (sec min hour day month dow [year]).
    // Standard cron has 5, so pin seconds to 0 and append a wildcard year.
    let field_count = trimmed.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {} *", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First occurrence strictly after `after`. Pure: asking twice with the same
/// reference returns the same answer.
pub fn next_cron_fire(schedule: &Schedule, after: NaiveDateTime) -> Option<NaiveDateTime> {
    schedule
        .after(&Utc.from_utc_datetime(&after))
        .next()
        .map(|dt| dt.naive_utc())
}

/// First occurrence at or after `at`.
fn cron_fire_at_or_after(schedule: &Schedule, at: NaiveDateTime) -> Option<NaiveDateTime> {
    let probe = at.checked_sub_signed(TimeDelta::seconds(1))?;
    schedule
        .after(&Utc.from_utc_datetime(&probe))
        .map(|dt| dt.naive_utc())
        .find(|t| *t >= at)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Recurrence {
    Interval {
        interval: Interval,
        origin: NaiveDateTime,
        /// Index of the occurrence `next` refers to.
        count: u32,
    },
    Cron(Box<Schedule>),
}

#[derive(Debug, Clone)]
struct Job {
    recurrence: Recurrence,
    /// Computed next fire; `None` once the schedule is exhausted.
    next: Option<NaiveDateTime>,
}

impl Job {
    fn first_at_or_after(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let next = self.next?;
        if next >= at {
            return Some(next);
        }
        match &self.recurrence {
            Recurrence::Interval {
                interval,
                origin,
                count,
            } => {
                let mut k = *count;
                loop {
                    let t = interval.nth_after(*origin, k)?;
                    if t >= at {
                        return Some(t);
                    }
                    k = k.checked_add(1)?;
                }
            }
            Recurrence::Cron(schedule) => cron_fire_at_or_after(schedule, at),
        }
    }

    /// Move `next` strictly past `after`, skipping occurrences missed while
    /// the loop was busy or the host was suspended.
    fn advance_past(&mut self, after: NaiveDateTime) {
        match &mut self.recurrence {
            Recurrence::Interval {
                interval,
                origin,
                count,
            } => {
                let mut k = *count;
                self.next = loop {
                    let Some(next_k) = k.checked_add(1) else {
                        break None;
                    };
                    k = next_k;
                    match interval.nth_after(*origin, k) {
                        Some(t) if t > after => break Some(t),
                        Some(_) => continue,
                        None => break None,
                    }
                };
                *count = k;
            }
            Recurrence::Cron(schedule) => {
                self.next = next_cron_fire(schedule, after);
            }
        }
    }
}

/// A job that came due: `scheduled` is the shared deadline it fired on, not
/// the wall-clock time the loop got around to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub job_id: String,
    pub scheduled: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Armed {
    at: NaiveDateTime,
    jobs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct JobScheduler {
    /// Registration order; the tie-break for simultaneous fires.
    order: Vec<String>,
    jobs: HashMap<String, Job>,
    pauses: HashMap<String, NaiveDateTime>,
    armed: Option<Armed>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval_job(
        &mut self,
        id: &str,
        spec: &str,
        now: NaiveDateTime,
    ) -> Result<(), ScheduleError> {
        self.ensure_absent(id)?;
        let interval = Interval::parse(spec)?;
        let next = interval
            .nth_after(now, 1)
            .ok_or_else(|| ScheduleError::NeverFires(spec.to_string()))?;
        self.insert(
            id,
            Job {
                recurrence: Recurrence::Interval {
                    interval,
                    origin: now,
                    count: 1,
                },
                next: Some(next),
            },
        );
        Ok(())
    }

    pub fn add_cron_job(
        &mut self,
        id: &str,
        expr: &str,
        now: NaiveDateTime,
    ) -> Result<(), ScheduleError> {
        self.ensure_absent(id)?;
        let schedule = parse_cron_expression(expr)?;
        let next = next_cron_fire(&schedule, now)
            .ok_or_else(|| ScheduleError::NeverFires(expr.to_string()))?;
        self.insert(
            id,
            Job {
                recurrence: Recurrence::Cron(Box::new(schedule)),
                next: Some(next),
            },
        );
        Ok(())
    }

    pub fn remove_job(&mut self, id: &str) -> Result<(), ScheduleError> {
        if self.jobs.remove(id).is_none() {
            return Err(ScheduleError::UnknownJob(id.to_string()));
        }
        self.order.retain(|j| j != id);
        self.pauses.remove(id);

        let was_armed = self
            .armed
            .as_ref()
            .is_some_and(|a| a.jobs.iter().any(|j| j == id));
        if was_armed {
            self.rearm();
        }
        Ok(())
    }

    /// Suppress every fire of `id` scheduled before `not_before`. The job
    /// then fires on its first own occurrence at or after `not_before`, and
    /// the override is consumed.
    pub fn pause_job(&mut self, id: &str, not_before: NaiveDateTime) -> Result<(), ScheduleError> {
        if !self.jobs.contains_key(id) {
            return Err(ScheduleError::UnknownJob(id.to_string()));
        }
        self.pauses.insert(id.to_string(), not_before);
        self.rearm();
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// The single armed deadline shared by all jobs.
    pub fn next_deadline(&self) -> Option<NaiveDateTime> {
        self.armed.as_ref().map(|a| a.at)
    }

    /// Pause-adjusted next fire of one job.
    pub fn next_fire(&self, id: &str) -> Option<NaiveDateTime> {
        self.effective_next(id)
    }

    /// If the deadline has been reached, return every job sharing it in
    /// registration order, advance those jobs, and re-arm from the rest.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<Firing> {
        let armed = match self.armed.take() {
            Some(a) if a.at <= now => a,
            other => {
                self.armed = other;
                return Vec::new();
            }
        };

        let after = armed.at.max(now);
        let mut fired = Vec::with_capacity(armed.jobs.len());
        for id in armed.jobs {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.advance_past(after);
            self.pauses.remove(&id);
            fired.push(Firing {
                job_id: id,
                scheduled: armed.at,
            });
        }

        self.rearm();
        fired
    }

    /// Drop every job, pause and the armed deadline.
    pub fn dispose(&mut self) {
        self.armed = None;
        self.pauses.clear();
        self.jobs.clear();
        self.order.clear();
    }

    fn ensure_absent(&self, id: &str) -> Result<(), ScheduleError> {
        if self.jobs.contains_key(id) {
            return Err(ScheduleError::DuplicateJob(id.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, id: &str, job: Job) {
        self.order.push(id.to_string());
        self.jobs.insert(id.to_string(), job);

        let Some(next) = self.effective_next(id) else {
            return;
        };
        match self.armed.as_ref().map(|a| next.cmp(&a.at)) {
            Some(Ordering::Equal) => {
                if let Some(armed) = self.armed.as_mut() {
                    armed.jobs.push(id.to_string());
                }
            }
            Some(Ordering::Greater) => {}
            _ => self.rearm(),
        }
    }

    fn effective_next(&self, id: &str) -> Option<NaiveDateTime> {
        let job = self.jobs.get(id)?;
        match self.pauses.get(id) {
            Some(not_before) => job.first_at_or_after(*not_before),
            None => job.next,
        }
    }

    fn rearm(&mut self) {
        let mut armed: Option<Armed> = None;
        for id in &self.order {
            let Some(next) = self.effective_next(id) else {
                continue;
            };
            match armed.as_ref().map(|a| next.cmp(&a.at)) {
                Some(Ordering::Equal) => {
                    if let Some(a) = armed.as_mut() {
                        a.jobs.push(id.clone());
                    }
                }
                Some(Ordering::Greater) => {}
                _ => {
                    armed = Some(Armed {
                        at: next,
                        jobs: vec![id.clone()],
                    })
                }
            }
        }
        self.armed = armed;
    }
}
