/// Exponential cool-off with optional jitter.
pub mod exponential;

/// Constant cool-off between attempts.
pub mod fixed {
    use std::time::Duration;

    /// An endless iterator of the same delay. Bound it with `take(n)`.
    #[derive(Debug, Clone, Copy)]
    pub struct Interval {
        delay: Duration,
    }

    impl Interval {
        pub fn new(delay: Duration) -> Self {
            Self { delay }
        }

        pub fn from_millis(millis: u64) -> Self {
            Self::new(Duration::from_millis(millis))
        }
    }

    impl Iterator for Interval {
        type Item = Duration;

        fn next(&mut self) -> Option<Self::Item> {
            Some(self.delay)
        }
    }

}
