//! Retry policy - 失敗した job をいつ・どう再実行するか
//!
//! `RetryPolicy` が契約（fault と試行回数から決定を返す）、
//! `RetryStrategy` が既定の実装（回数上限 + 待ち時間の式）。

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{RetryDecision, TaskFault};

pub trait RetryPolicy: Send + Sync {
    /// `attempts` is the number of executions finished before this one.
    fn retry_decision(
        &self,
        fault: &TaskFault,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<RetryDecision>;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_decision(&self, _: &TaskFault, _: u32, _: DateTime<Utc>) -> Option<RetryDecision> {
        None
    }
}

/// Retry up to `max_attempts` more times, waiting
/// `wait + linear_wait * attempts + exponential_wait ^ (attempts + 1)` seconds
/// (the exponential term only when `exponential_wait > 0`), plus up to `jitter`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    /// `None` = retry forever
    pub max_attempts: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
    #[serde(with = "humantime_serde")]
    pub linear_wait: Duration,
    /// Base of the exponential term, in seconds.
    pub exponential_wait: u32,
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Fault kinds to retry. Empty = every fault.
    pub retry_on: Vec<String>,
    pub priority: Option<i32>,
    pub queue: Option<String>,
    pub lock: Option<String>,
}

impl RetryStrategy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn forever() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_linear_wait(mut self, linear_wait: Duration) -> Self {
        self.linear_wait = linear_wait;
        self
    }

    pub fn with_exponential_wait(mut self, base_seconds: u32) -> Self {
        self.exponential_wait = base_seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delay before retry number `attempts + 1`, without jitter.
    pub fn delay(&self, attempts: u32) -> Duration {
        let linear = self.linear_wait.saturating_mul(attempts);
        let exponential = if self.exponential_wait > 0 {
            let secs = u64::from(self.exponential_wait)
                .checked_pow(attempts.saturating_add(1))
                .unwrap_or(u64::MAX);
            Duration::from_secs(secs)
        } else {
            Duration::ZERO
        };
        self.wait.saturating_add(linear).saturating_add(exponential)
    }

    fn should_retry(&self, fault: &TaskFault, attempts: u32) -> bool {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return false;
        }
        self.retry_on.is_empty()
            || fault
                .kind()
                .is_some_and(|kind| self.retry_on.iter().any(|k| k == kind))
    }
}

impl RetryPolicy for RetryStrategy {
    fn retry_decision(
        &self,
        fault: &TaskFault,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<RetryDecision> {
        if !self.should_retry(fault, attempts) {
            return None;
        }

        let mut delay = self.delay(attempts);
        if !self.jitter.is_zero() {
            let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
            delay = delay.saturating_add(Duration::from_millis(
                rand::thread_rng().gen_range(0..=max_ms),
            ));
        }

        // 表現できない未来は chrono の上限に丸める
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(RetryDecision {
            retry_at,
            priority: self.priority,
            queue: self.queue.clone(),
            lock: self.lock.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[rstest]
    #[case::constant(RetryStrategy::forever().with_wait(Duration::from_secs(5)), 3, 5)]
    #[case::linear(RetryStrategy::forever().with_linear_wait(Duration::from_secs(2)), 3, 6)]
    #[case::exponential(RetryStrategy::forever().with_exponential_wait(2), 3, 16)]
    #[case::combined(
        RetryStrategy::forever()
            .with_wait(Duration::from_secs(1))
            .with_linear_wait(Duration::from_secs(1))
            .with_exponential_wait(3),
        1,
        1 + 1 + 9
    )]
    #[case::immediate(RetryStrategy::forever(), 7, 0)]
    fn delay_formula(#[case] strategy: RetryStrategy, #[case] attempts: u32, #[case] secs: u64) {
        assert_eq!(strategy.delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn exponential_delay_saturates() {
        let strategy = RetryStrategy::forever().with_exponential_wait(10);
        assert!(strategy.delay(100) >= Duration::from_secs(u64::MAX / 2));
    }

    #[rstest]
    #[case(12)]
    #[case(100)]
    fn huge_delay_clamps_retry_time(#[case] attempts: u32) {
        let strategy = RetryStrategy::forever().with_exponential_wait(10);
        let decision = strategy
            .retry_decision(&TaskFault::new("x"), attempts, now())
            .unwrap();
        assert_eq!(decision.retry_at, DateTime::<Utc>::MAX_UTC);
    }

    #[rstest]
    #[case(0, true)]
    #[case(2, true)]
    #[case(3, false)]
    #[case(10, false)]
    fn max_attempts_limit(#[case] attempts: u32, #[case] retried: bool) {
        let strategy = RetryStrategy::attempts(3);
        let decision = strategy.retry_decision(&TaskFault::new("boom"), attempts, now());
        assert_eq!(decision.is_some(), retried);
    }

    #[test]
    fn decision_carries_time_and_overrides() {
        let strategy = RetryStrategy::attempts(1)
            .with_wait(Duration::from_secs(30))
            .with_queue("retries")
            .with_priority(-1);
        let decision = strategy
            .retry_decision(&TaskFault::new("boom"), 0, now())
            .unwrap();
        assert_eq!(decision.retry_at, now() + chrono::Duration::seconds(30));
        assert_eq!(decision.queue.as_deref(), Some("retries"));
        assert_eq!(decision.priority, Some(-1));
        assert_eq!(decision.lock, None);
    }

    #[test]
    fn retry_on_filters_fault_kinds() {
        let strategy = RetryStrategy::forever().retry_on("http");
        let http = TaskFault::new("503").with_kind("http");
        let other = TaskFault::new("bad input").with_kind("validation");
        let unlabelled = TaskFault::new("??");

        assert!(strategy.retry_decision(&http, 0, now()).is_some());
        assert!(strategy.retry_decision(&other, 0, now()).is_none());
        assert!(strategy.retry_decision(&unlabelled, 0, now()).is_none());
    }

    #[test]
    fn jitter_stays_within_bound() {
        let strategy = RetryStrategy::forever()
            .with_wait(Duration::from_secs(10))
            .with_jitter(Duration::from_secs(2));
        for _ in 0..20 {
            let at = strategy
                .retry_decision(&TaskFault::new("x"), 0, now())
                .unwrap()
                .retry_at;
            assert!(at >= now() + chrono::Duration::seconds(10));
            assert!(at <= now() + chrono::Duration::seconds(12));
        }
    }

    #[test]
    fn no_retry_never_decides() {
        assert!(NoRetry.retry_decision(&TaskFault::new("x"), 0, now()).is_none());
    }

    #[test]
    fn strategy_deserializes_humantime() {
        let strategy: RetryStrategy =
            serde_json::from_str(r#"{"max_attempts": 3, "wait": "1m 30s", "retry_on": ["io"]}"#)
                .unwrap();
        assert_eq!(strategy.max_attempts, Some(3));
        assert_eq!(strategy.wait, Duration::from_secs(90));
        assert_eq!(strategy.retry_on, vec!["io".to_string()]);
    }
}
