use std::time::Duration;

use tokio::time::Instant;

/// Point in time after which a call is abandoned.
///
/// Built on `tokio::time::Instant` so paused-clock tests observe it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    /// No deadline; calls are bounded only by their own timeouts.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// `timeout` shortened so it never outlives this deadline.
    pub fn cap(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => timeout.min(left),
            None => timeout,
        }
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline { at: Some(a.min(b)) },
            (Some(_), None) => self,
            _ => other,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.cap(Duration::from_secs(5)), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_none_is_unbounded() {
        let deadline = Deadline::none();
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
        assert_eq!(deadline.cap(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_min_picks_earlier() {
        let short = Deadline::after(Duration::from_millis(10));
        let long = Deadline::after(Duration::from_secs(10));
        assert_eq!(short.min(long), short);
        assert_eq!(long.min(short), short);
        assert_eq!(Deadline::none().min(long), long);
    }
}
