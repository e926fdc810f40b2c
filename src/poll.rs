use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep};

/// Fixed-interval poll bounded by both a timeout and an attempt count.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(750),
            timeout: Duration::from_secs(6),
            max_attempts: 10,
        }
    }
}

impl PollPolicy {
    /// A single attempt, no waiting.
    pub fn once() -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            max_attempts: 1,
        }
    }
}

/// Runs `attempt` until it yields `Some`, the attempt budget is spent, or the
/// next wait would cross the deadline.
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0;
    loop {
        attempts += 1;
        if let Some(value) = attempt().await {
            return Some(value);
        }
        if attempts >= policy.max_attempts.max(1)
            || policy.interval.is_zero()
            || Instant::now() + policy.interval > deadline
        {
            return None;
        }
        sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn once_policy_makes_a_single_attempt() {
        let mut calls = 0;
        let out: Option<()> = poll_until(&PollPolicy::once(), || {
            calls += 1;
            async { None }
        })
        .await;
        assert!(out.is_none());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn stops_at_attempt_budget() {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            max_attempts: 3,
        };
        let mut calls = 0;
        let out: Option<()> = poll_until(&policy, || {
            calls += 1;
            async { None }
        })
        .await;
        assert!(out.is_none());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn returns_first_success() {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
            max_attempts: 5,
        };
        let mut calls = 0;
        let out = poll_until(&policy, || {
            calls += 1;
            let ready = calls == 2;
            async move { ready.then_some(calls) }
        })
        .await;
        assert_eq!(out, Some(2));
    }
}
