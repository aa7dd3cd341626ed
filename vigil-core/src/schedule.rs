//! Schedule evaluation.
//!
//! Pure functions that turn a policy's schedule descriptor plus its last run
//! into the next time it is due. Descriptors are parsed once at policy
//! create/update time; anything unparseable is rejected there as a
//! configuration error so evaluation never has to guess.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use vigil_model::{Policy, PolicyStatus, ScheduleDescriptor, ScheduleType};

use crate::error::{Result, VigilError};

/// Parsed, validated form of a [`ScheduleDescriptor`].
#[derive(Clone)]
pub enum Schedule {
    /// One-shot: due once, then only on explicit re-trigger.
    Quick,
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Quick => f.write_str("Quick"),
            Schedule::Interval(every) => {
                f.debug_tuple("Interval").field(every).finish()
            }
            Schedule::Cron(expr) => {
                f.debug_tuple("Cron").field(&expr.to_string()).finish()
            }
        }
    }
}

impl Schedule {
    pub fn parse(descriptor: &ScheduleDescriptor) -> Result<Self> {
        let value = descriptor
            .value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match (descriptor.schedule_type, value) {
            (ScheduleType::Quick, None) => Ok(Schedule::Quick),
            (ScheduleType::Quick, Some(v)) => Err(VigilError::Configuration(
                format!("QUICK schedules take no value (got {v:?})"),
            )),
            (ScheduleType::Interval, Some(v)) => parse_interval(v),
            (ScheduleType::Cron, Some(v)) => parse_cron(v),
            (kind, None) => Err(VigilError::Configuration(format!(
                "{kind} schedule requires a value"
            ))),
        }
    }

    /// Next due time according to the schedule alone.
    ///
    /// `last_run_at` is the dispatch time of the most recent run, `created_at`
    /// anchors cron schedules that have never run.
    pub fn next_after(
        &self,
        last_run_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Quick => match last_run_at {
                None => Some(created_at),
                Some(_) => None,
            },
            Schedule::Interval(every) => match last_run_at {
                None => Some(created_at),
                Some(last) => last.checked_add_signed(*every),
            },
            Schedule::Cron(expr) => {
                let anchor = last_run_at.unwrap_or(created_at);
                expr.after(&anchor).find(|at| *at > anchor)
            }
        }
    }
}

fn parse_interval(raw: &str) -> Result<Schedule> {
    let std_duration = humantime::parse_duration(raw).map_err(|e| {
        VigilError::Configuration(format!("invalid interval {raw:?}: {e}"))
    })?;
    let every = Duration::from_std(std_duration).map_err(|_| {
        VigilError::Configuration(format!("interval {raw:?} is too large"))
    })?;
    if every <= Duration::zero() {
        return Err(VigilError::Configuration(format!(
            "interval {raw:?} must be positive"
        )));
    }
    Ok(Schedule::Interval(every))
}

fn parse_cron(raw: &str) -> Result<Schedule> {
    let fields = raw.split_whitespace().count();
    let normalized = match fields {
        // Classic crontab: pin seconds to zero.
        5 => format!("0 {raw}"),
        6 | 7 => raw.to_string(),
        _ => {
            return Err(VigilError::Configuration(format!(
                "cron expression {raw:?} must have 5, 6 or 7 fields"
            )));
        }
    };
    let expr = cron::Schedule::from_str(&normalized).map_err(|e| {
        VigilError::Configuration(format!("invalid cron expression {raw:?}: {e}"))
    })?;
    if expr.upcoming(Utc).next().is_none() {
        return Err(VigilError::Configuration(format!(
            "cron expression {raw:?} never fires"
        )));
    }
    Ok(Schedule::Cron(Box::new(expr)))
}

/// `next_run_at` for a policy: the schedule formula, pulled forward by an
/// outstanding manual trigger.
pub fn next_run_at(
    schedule: &Schedule,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    trigger_requested_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let formula = schedule.next_after(last_run_at, created_at);
    match (formula, trigger_requested_at) {
        (Some(at), Some(trigger)) => Some(at.min(trigger)),
        (at, trigger) => at.or(trigger),
    }
}

/// Recompute `next_run_at` from the policy's own fields.
pub fn policy_next_run_at(policy: &Policy) -> Result<Option<DateTime<Utc>>> {
    let schedule = Schedule::parse(&policy.schedule)?;
    Ok(next_run_at(
        &schedule,
        policy.last_run_at,
        policy.created_at,
        policy.trigger_requested_at,
    ))
}

pub fn is_due(policy: &Policy, now: DateTime<Utc>) -> bool {
    policy.status == PolicyStatus::Active
        && policy.next_run_at.is_some_and(|at| at <= now)
}
