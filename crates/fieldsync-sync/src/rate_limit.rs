//! # Leading-Edge Debounce
//!
//! A timestamp guard: the first call in a window passes, every call until
//! the window has elapsed is dropped.
//!
//! ```text
//!  t=0     t=0.5   t=1.9   t=2.0   t=2.4
//!  pass    drop    drop    pass    drop        (window = 2s)
//! ```

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Leading-edge rate limiter.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Debounce {
            window,
            last_accepted: Mutex::new(None),
        }
    }

    /// Returns true and starts a new window if the previous one has elapsed.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_accepted.lock().unwrap_or_else(|e| e.into_inner());

        match *last {
            Some(at) if now.duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forgets the current window so the next call passes.
    pub fn reset(&self) {
        *self.last_accepted.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_leading_edge() {
        let debounce = Debounce::new(Duration::from_secs(2));

        assert!(debounce.try_acquire());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!debounce.try_acquire());
        tokio::time::advance(Duration::from_millis(1400)).await;
        assert!(!debounce.try_acquire());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(debounce.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reopens_window() {
        let debounce = Debounce::new(Duration::from_secs(2));

        assert!(debounce.try_acquire());
        assert!(!debounce.try_acquire());
        debounce.reset();
        assert!(debounce.try_acquire());
    }
}
