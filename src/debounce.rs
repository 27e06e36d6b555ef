use std::time::{Duration, Instant};

/// Holds the most recent value until it has been left alone for `window`.
///
/// Each `schedule` replaces the pending value and restarts the window, so only
/// the last value of a burst is ever released.
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn schedule(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now));
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left before the pending value is released.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let (_, scheduled_at) = self.pending.as_ref()?;
        Some(
            self.window
                .saturating_sub(now.saturating_duration_since(*scheduled_at)),
        )
    }

    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.remaining(now) {
            Some(remaining) if remaining.is_zero() => {
                self.pending.take().map(|(value, _)| value)
            }
            _ => None,
        }
    }

    /// Releases whatever is pending regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }
}
