//! Retry policy for transient network failures.

use std::fmt;
use std::time::Duration;

use super::error::TransportError;

/// Decides whether a failed attempt may be retried.
pub type RetryClassifier = fn(&TransportError) -> bool;

/// Exponential backoff policy applied by the transport.
///
/// Retry `n` (1-based) waits `base_delay * 2^(n-1)` before being sent, so the
/// defaults give delays of 1s, 2s and 4s for four attempts in total.
#[derive(Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub classifier: RetryClassifier,
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
      classifier: TransportError::is_retryable,
    }
  }

  /// A policy that never retries.
  pub fn none() -> Self {
    Self::new(0, Duration::ZERO)
  }

  pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  /// Total number of attempts, counting the first.
  pub fn max_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }

  /// Delay before retry number `retry` (1-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    self.base_delay.saturating_mul(1u32 << exponent)
  }

  /// Whether `error` is the kind of failure this policy retries.
  pub fn is_retryable(&self, error: &TransportError) -> bool {
    (self.classifier)(error)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(1000))
  }
}

impl fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_retries", &self.max_retries)
      .field("base_delay", &self.base_delay)
      .finish_non_exhaustive()
  }
}
