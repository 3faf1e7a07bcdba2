//! Reconnect policy
//!
//! Every time a client session ends, for whatever reason, exactly one new
//! attempt is scheduled after a fixed delay. Attempts run one after another
//! on a single task, so at most one is ever pending.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Default pause between the end of a session and the next attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How the client retries after a connection ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed pause before each new attempt
    pub delay: Duration,
    /// Stop after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Number of the attempt after `attempt`, or `None` once the budget is spent
    ///
    /// The counter saturates at `u32::MAX` so an unbounded policy retries forever.
    fn next_attempt(&self, attempt: u32) -> Option<u32> {
        match attempt.checked_add(1) {
            Some(next) if self.allows(next) => Some(next),
            Some(_) => None,
            None => self.max_attempts.is_none().then_some(u32::MAX),
        }
    }

    /// Run `session` until the attempt budget is spent
    ///
    /// `session` receives the 1-based attempt number. Its outcome is only
    /// logged: a clean close and a failure both lead to the next attempt.
    /// Returns the number of attempts made, which only happens when
    /// `max_attempts` is set; wrap the call in a `select!` to stop it early.
    pub async fn run<F, Fut, T, E>(&self, mut session: F) -> u32
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Display,
        E: Display,
    {
        let mut attempt: u32 = 1;
        loop {
            match session(attempt).await {
                Ok(outcome) => tracing::info!("Session ended: {}", outcome),
                Err(e) => tracing::warn!("Session failed: {}", e),
            }

            let next = match self.next_attempt(attempt) {
                Some(next) => next,
                None => {
                    tracing::warn!("Giving up after {} attempts", attempt);
                    return attempt;
                }
            };

            tracing::info!("Reconnecting in {:?} (attempt {})", self.delay, next);
            tokio::time::sleep(self.delay).await;
            attempt = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retries_under_sustained_failure() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let policy = ReconnectPolicy::default();
        let begin = Instant::now();

        let recorded = attempts.clone();
        let run = policy.run(move |attempt| {
            recorded.lock().unwrap().push((attempt, Instant::now() - begin));
            async { Err::<String, _>("connection refused") }
        });
        let finished = tokio::time::timeout(Duration::from_secs(10), run).await;
        assert!(finished.is_err(), "an unbounded policy never returns");

        let attempts = attempts.lock().unwrap();
        assert!(attempts.len() >= 3);
        for (i, (number, at)) in attempts.iter().enumerate() {
            assert_eq!(*number, i as u32 + 1);
            assert_eq!(*at, Duration::from_secs(i as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_also_reconnects() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(250)).with_max_attempts(4);
        let begin = Instant::now();

        let made = policy
            .run(|_| async { Ok::<_, String>("closed by peer") })
            .await;

        assert_eq!(made, 4);
        assert_eq!(Instant::now() - begin, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_single_attempt_budget() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(3600)).with_max_attempts(1);
        let made = policy.run(|_| async { Err::<String, _>("boom") }).await;
        assert_eq!(made, 1);
    }

    #[test]
    fn test_attempt_counter_saturates() {
        let unbounded = ReconnectPolicy::fixed(Duration::ZERO);
        assert_eq!(unbounded.next_attempt(1), Some(2));
        assert_eq!(unbounded.next_attempt(u32::MAX), Some(u32::MAX));

        let bounded = ReconnectPolicy::fixed(Duration::ZERO).with_max_attempts(u32::MAX);
        assert_eq!(bounded.next_attempt(u32::MAX - 1), Some(u32::MAX));
        assert_eq!(bounded.next_attempt(u32::MAX), None);
    }

    #[test]
    fn test_allows() {
        let unbounded = ReconnectPolicy::default();
        assert!(unbounded.allows(u32::MAX));
        assert_eq!(unbounded.delay, Duration::from_secs(1));

        let bounded = ReconnectPolicy::default().with_max_attempts(2);
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }
}
