use std::time::{Duration, Instant};
use thiserror::Error;

/// Entries scanned between deadline checks.
pub(crate) const SCAN_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Deadline exceeded during index scan")]
pub struct DeadlineExceeded;

/// Optional wall-clock bound on an O(N) index scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|limit| Instant::now() >= limit)
    }

    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        if self.is_expired() {
            Err(DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_expires() {
        assert!(Deadline::none().check().is_ok());
        assert!(Deadline::default().check().is_ok());
    }

    #[test]
    fn test_past_deadline_expires() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(5));
        assert_eq!(deadline.check(), Err(DeadlineExceeded));
    }

    #[test]
    fn test_future_deadline_holds() {
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
    }
}
