//! Retry/backoff policy.

use chrono::{DateTime, Duration, Utc};

use crate::model::Job;

/// Ceiling on computed backoff, regardless of attempt count.
pub const MAX_BACKOFF_SECS: i64 = 3600;

/// Exponential backoff: `retry_delay * 2^retry_count`, capped at
/// `MAX_BACKOFF_SECS`. `retry_count` is the count *before* this attempt, so
/// the first retry backs off by `retry_delay * 2^0 = retry_delay`.
pub fn backoff_seconds(job: &Job) -> i64 {
    let multiplier = 2i64.saturating_pow(job.retry_count.max(0) as u32);
    job.retry_delay.saturating_mul(multiplier).min(MAX_BACKOFF_SECS)
}

/// The timestamp a failed job becomes eligible for its next claim.
pub fn next_eligible_at(job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::seconds(backoff_seconds(job))
}

/// Whether a failure should be retried, given the job's current budget.
/// `always_terminal` short-circuits this for error kinds (e.g. a tampered
/// closure) that must never be retried no matter the remaining budget.
pub fn should_retry(job: &Job, always_terminal: bool) -> bool {
    !always_terminal && job.has_retry_budget()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CallableType, Job};

    fn job_with(retry_count: i32, retry_delay: i64, max_retries: i32) -> Job {
        Job::builder()
            .name("test")
            .callable_type(CallableType::Function)
            .callable(b"f".to_vec())
            .params(b"[]".to_vec())
            .retry_count(retry_count)
            .retry_delay(retry_delay)
            .max_retries(max_retries)
            .build()
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let j0 = job_with(0, 5, 3);
        let j1 = job_with(1, 5, 3);
        let j2 = job_with(2, 5, 3);
        assert_eq!(backoff_seconds(&j0), 5);
        assert_eq!(backoff_seconds(&j1), 10);
        assert_eq!(backoff_seconds(&j2), 20);
    }

    #[test]
    fn backoff_is_capped() {
        let j = job_with(20, 5, 30);
        assert_eq!(backoff_seconds(&j), MAX_BACKOFF_SECS);
    }

    #[test]
    fn should_retry_respects_budget() {
        // max_retries=3: retry_count=1 -> next=2, 2<3, still retries.
        // retry_count=2 -> next=3, 3<3 is false, terminal instead.
        let within_budget = job_with(1, 5, 3);
        let exhausted = job_with(2, 5, 3);
        assert!(should_retry(&within_budget, false));
        assert!(!should_retry(&exhausted, false));
    }

    #[test]
    fn max_retries_two_dead_letters_after_exactly_two_attempts() {
        // Mirrors the documented scenario: max_retries=2. The job fails
        // once (retry_count 0 -> 1, still retries since next=1<2), then
        // fails again at retry_count=1 (next=2, 2<2 is false) and goes
        // terminal without retry_count ever reaching 2.
        let first_failure = job_with(0, 0, 2);
        assert!(should_retry(&first_failure, false));
        let second_failure = job_with(1, 0, 2);
        assert!(!should_retry(&second_failure, false));
    }

    #[test]
    fn always_terminal_overrides_budget() {
        let within_budget = job_with(0, 5, 3);
        assert!(!should_retry(&within_budget, true));
    }
}
