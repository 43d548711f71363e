// Wait Steps - Computes when a suspended run becomes runnable again

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use super::conditions::evaluate_groups;
use super::error::EngineError;
use super::models::WaitState;
use super::steps::{add_saturating, bounded_seconds, DelaySpec, Step, StepId, WaitSpec};

/// Engine-wide fallbacks for condition waits
#[derive(Debug, Clone, Copy)]
pub struct WaitDefaults {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Business-hours waits without their own timezone use this one
    pub timezone: Tz,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The wait is over; continue at `next`
    Continue { next: Option<StepId>, timed_out: bool },
    /// Park the run until `resumes_at`
    Suspend { resumes_at: DateTime<Utc>, state: WaitState },
}

/// Decide a wait step. `state` is the run's current wait state when it is
/// resuming this same step, so elapsed time and deadlines carry across wakes.
pub fn evaluate_wait(
    step: &Step,
    spec: &WaitSpec,
    state: Option<&WaitState>,
    snapshot: &Value,
    now: DateTime<Utc>,
    defaults: WaitDefaults,
) -> Result<WaitOutcome, EngineError> {
    let state = state.filter(|s| s.step_id == step.id);
    let started_at = state.map(|s| s.started_at).unwrap_or(now);
    let proceed = WaitOutcome::Continue { next: step.next.clone(), timed_out: false };
    let suspend = |resumes_at: DateTime<Utc>, deadline: Option<DateTime<Utc>>| WaitOutcome::Suspend {
        resumes_at,
        state: WaitState {
            step_id: step.id.clone(),
            started_at,
            deadline,
        },
    };

    let outcome = match spec {
        WaitSpec::Duration { amount, unit } => {
            let resumes_at = add_saturating(started_at, DelaySpec::new(*amount, *unit).to_duration());
            if now >= resumes_at { proceed } else { suspend(resumes_at, None) }
        }

        WaitSpec::Until { at } => {
            if now >= *at { proceed } else { suspend(*at, None) }
        }

        WaitSpec::UntilCondition {
            groups,
            logic,
            poll_interval_seconds,
            max_wait_seconds,
            timeout_next,
        } => {
            let poll = poll_interval_seconds
                .map(bounded_seconds)
                .unwrap_or(defaults.poll_interval);
            let deadline = state.and_then(|s| s.deadline).unwrap_or_else(|| {
                add_saturating(started_at, max_wait_seconds.map(bounded_seconds).unwrap_or(defaults.max_wait))
            });

            if evaluate_groups(groups, *logic, snapshot, now) {
                proceed
            } else if now >= deadline {
                WaitOutcome::Continue {
                    next: timeout_next.clone().or_else(|| step.next.clone()),
                    timed_out: true,
                }
            } else {
                suspend(add_saturating(now, poll).min(deadline), Some(deadline))
            }
        }

        WaitSpec::BusinessHours {
            timezone,
            start_hour,
            end_hour,
            days,
        } => {
            let tz: Tz = match timezone {
                Some(name) => name
                    .parse()
                    .map_err(|_| EngineError::step(&step.id, format!("unknown timezone '{}'", name)))?,
                None => defaults.timezone,
            };
            match next_business_window(now, tz, *start_hour, *end_hour, days) {
                Some(opens_at) if opens_at <= now => proceed,
                Some(opens_at) => suspend(opens_at, None),
                None => return Err(EngineError::step(&step.id, "no business-hours window in the next week")),
            }
        }
    };

    Ok(outcome)
}

/// `now` if it falls inside a window, otherwise the start of the next window.
pub fn next_business_window(
    now: DateTime<Utc>,
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
    days: &[chrono::Weekday],
) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&tz);
    if days.contains(&local.weekday()) && local.hour() >= start_hour && local.hour() < end_hour {
        return Some(now);
    }

    let opening = NaiveTime::from_hms_opt(start_hour, 0, 0)?;
    (0..=7).find_map(|offset| {
        let date = local.date_naive() + Duration::days(offset);
        if !days.contains(&date.weekday()) {
            return None;
        }
        // `earliest` skips openings that fall in a DST gap
        let start = tz.from_local_datetime(&date.and_time(opening)).earliest()?;
        let start = start.with_timezone(&Utc);
        (start > now).then_some(start)
    })
}
