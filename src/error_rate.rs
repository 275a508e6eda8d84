//! Sliding-window 5xx rate over the most recent requests.

use std::collections::VecDeque;

use crate::event::ErrorRateEvent;

/// Fixed-capacity window of request outcomes (`true` = 5xx).
///
/// The tracker does no rate limiting of its own: while the rate stays above
/// the threshold, every recorded outcome yields an event and the dispatcher's
/// cooldown decides what reaches the notifier.
#[derive(Debug, Clone)]
pub struct ErrorRateTracker {
    window: VecDeque<bool>,
    capacity: usize,
    min_requests: usize,
    threshold: f64,
    errors: usize,
}

impl ErrorRateTracker {
    /// Create a tracker that evaluates only once the window is full.
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self::with_min_requests(window_size, threshold, None)
    }

    /// Create a tracker that starts evaluating once `min_requests` outcomes
    /// have been recorded. `None` means the full window.
    ///
    /// A zero window size is treated as one; `min_requests` is clamped to
    /// `1..=window_size`.
    pub fn with_min_requests(
        window_size: usize,
        threshold: f64,
        min_requests: Option<usize>,
    ) -> Self {
        let capacity = window_size.max(1);
        let min_requests = min_requests.unwrap_or(capacity).clamp(1, capacity);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_requests,
            threshold,
            errors: 0,
        }
    }

    /// Record one outcome and return an event if the threshold is exceeded.
    ///
    /// The returned event carries no pool; the caller fills it in.
    pub fn record(&mut self, is_error: bool) -> Option<ErrorRateEvent> {
        self.window.push_back(is_error);
        if is_error {
            self.errors = self.errors.saturating_add(1);
        }
        if self.window.len() > self.capacity && self.window.pop_front() == Some(true) {
            self.errors = self.errors.saturating_sub(1);
        }

        if self.window.len() < self.min_requests {
            return None;
        }

        let rate = self.rate()?;
        if rate > self.threshold {
            Some(ErrorRateEvent {
                rate,
                threshold: self.threshold,
                error_count: self.errors,
                window_len: self.window.len(),
                current_pool: None,
            })
        } else {
            None
        }
    }

    /// Current error percentage, or `None` when the window is empty.
    pub fn rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.errors as f64 / self.window.len() as f64 * 100.0;
        Some(rate)
    }

    /// Number of 5xx outcomes currently in the window.
    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Number of outcomes currently in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether no outcome has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Maximum number of outcomes kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Outcomes in the window, oldest first.
    pub fn outcomes(&self) -> impl Iterator<Item = bool> + '_ {
        self.window.iter().copied()
    }
}
