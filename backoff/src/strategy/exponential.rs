use std::time::Duration;

use rand::Rng;

/// Delays that grow by `factor` on every attempt, starting at `base` and capped at `max`.
///
/// The n-th delay (1-based) is `base * factor^(n-1)`, multiplied by a random factor in
/// `[1 - jitter, 1 + jitter]` when jitter is non-zero, then capped at `max`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut delays = Exponential::from_millis(100, 1_000, 2.0, 0.0, Some(3));
/// assert_eq!(delays.next(), Some(Duration::from_millis(100)));
/// assert_eq!(delays.next(), Some(Duration::from_millis(200)));
/// assert_eq!(delays.next(), Some(Duration::from_millis(400)));
/// assert_eq!(delays.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    /// None retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(
        base_ms: u64,
        max_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Starts over from the base delay, e.g. after the guarded operation made progress.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since creation or the last reset.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    fn delay_for(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.saturating_sub(1));
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}
