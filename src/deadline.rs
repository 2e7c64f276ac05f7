//! Call deadlines.
//!
//! A deadline is an absolute wall-clock instant. Tracking one spawns a timer
//! that fires a [`CancellationToken`] when the instant passes; a deadline
//! that is already in the past fires immediately.

use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;

/// An optional absolute deadline plus the token it fires on expiry.
#[derive(Debug)]
pub struct Deadline {
    value: Option<SystemTime>,
    expired: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl Deadline {
    /// Start tracking `value`. Must be called from within a tokio runtime
    /// when `value` is in the future.
    pub fn track(value: Option<SystemTime>) -> Self {
        let expired = CancellationToken::new();
        let timer = match value {
            None => None,
            Some(at) => match remaining(at) {
                None => {
                    expired.cancel();
                    None
                }
                Some(left) => {
                    let token = expired.clone();
                    Some(tokio::spawn(async move {
                        tokio::time::sleep(left).await;
                        token.cancel();
                    }))
                }
            },
        };
        Self {
            value,
            expired,
            timer,
        }
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self::track(None)
    }

    #[inline]
    pub fn value(&self) -> Option<SystemTime> {
        self.value
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Token fired when the deadline passes.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.expired
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Time left until `at`, or `None` if it has passed.
pub(crate) fn remaining(at: SystemTime) -> Option<Duration> {
    match at.duration_since(SystemTime::now()) {
        Ok(left) if !left.is_zero() => Some(left),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_deadline_never_expires() {
        let deadline = Deadline::none();
        assert_eq!(deadline.value(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!deadline.is_expired());
    }

    #[tokio::test]
    async fn test_past_deadline_expires_immediately() {
        let at = SystemTime::now() - Duration::from_secs(1);
        let deadline = Deadline::track(Some(at));
        assert!(deadline.is_expired());
    }

    #[tokio::test]
    async fn test_future_deadline_fires() {
        let deadline = Deadline::track(Some(SystemTime::now() + Duration::from_millis(50)));
        assert!(!deadline.is_expired());
        tokio::time::timeout(Duration::from_secs(2), deadline.token().cancelled())
            .await
            .unwrap();
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_remaining() {
        assert!(remaining(SystemTime::now() - Duration::from_secs(5)).is_none());
        assert!(remaining(SystemTime::now() + Duration::from_secs(5)).is_some());
    }
}
