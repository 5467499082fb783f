//! Shared cancellation and progress reporting for dispatch calls.
//!
//! One [`ProgressIndicator`] is shared by every sub-task spawned for a single
//! dispatch or drain call; cancelling it cancels all siblings.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Error returned by [`ProgressIndicator::check_canceled`] once the
/// indicator has been canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation canceled")
    }
}

impl std::error::Error for Canceled {}

/// Thread-safe cancellation token with informational fraction and text.
///
/// Cancellation is monotonic: once canceled, the indicator stays canceled.
/// Fraction and text are purely informational and never affect control flow.
#[derive(Debug, Default)]
pub struct ProgressIndicator {
    canceled: AtomicBool,
    fraction_bits: AtomicU64,
    text: Mutex<String>,
}

impl ProgressIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn check_canceled(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    pub fn set_fraction(&self, fraction: f64) {
        self.fraction_bits
            .store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub fn fraction(&self) -> f64 {
        f64::from_bits(self.fraction_bits.load(Ordering::Relaxed))
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *self.lock_text() = text.into();
    }

    pub fn text(&self) -> String {
        self.lock_text().clone()
    }

    fn lock_text(&self) -> std::sync::MutexGuard<'_, String> {
        match self.text.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_monotonic() {
        let progress = ProgressIndicator::new();
        assert!(!progress.is_canceled());
        assert!(progress.check_canceled().is_ok());

        progress.cancel();
        assert!(progress.is_canceled());
        assert_eq!(progress.check_canceled(), Err(Canceled));

        // A second cancel is a no-op, never an un-cancel.
        progress.cancel();
        assert!(progress.is_canceled());
    }

    #[test]
    fn fraction_and_text_round_trip() {
        let progress = ProgressIndicator::new();
        assert_eq!(progress.fraction(), 0.0);

        progress.set_fraction(0.75);
        assert_eq!(progress.fraction(), 0.75);

        progress.set_text("scanning");
        assert_eq!(progress.text(), "scanning");
    }
}
