use std::collections::HashMap;
use std::sync::Arc;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollSettings;
use crate::error::{Error, Result};
use crate::sink::PointSink;
use crate::store::RoutePointStore;

const SCAN_RETRY_BASE_MS: u64 = 100;
const SCAN_RETRY_MAX_MS: u64 = 5_000;
const SCAN_RETRY_ATTEMPTS: u16 = 5;

/// Source of "now" for the watermark arithmetic.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Scans the point store one time window per cycle and delivers what it finds.
///
/// The watermark is the exclusive lower bound of the next window. After each successful scan it
/// moves forward by the quantum but never past "now" and never backwards. A failed scan leaves
/// it untouched.
pub struct WindowedPollSource {
    settings: PollSettings,
    store: Arc<dyn RoutePointStore>,
    sink: Arc<dyn PointSink>,
    clock: Clock,
    watermark: DateTime<Utc>,
    /// row key -> store timestamp of rows delivered inside the trailing grace window
    delivered: HashMap<String, DateTime<Utc>>,
}

impl WindowedPollSource {
    pub fn new(
        settings: PollSettings,
        store: Arc<dyn RoutePointStore>,
        sink: Arc<dyn PointSink>,
    ) -> Self {
        Self::with_clock(settings, store, sink, Arc::new(Utc::now))
    }

    pub fn with_clock(
        settings: PollSettings,
        store: Arc<dyn RoutePointStore>,
        sink: Arc<dyn PointSink>,
        clock: Clock,
    ) -> Self {
        let now = clock();
        let watermark = now
            .checked_sub_signed(settings.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            settings,
            store,
            sink,
            clock,
            watermark,
            delivered: HashMap::new(),
        }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    /// Scans one window and advances the watermark. Returns the number of points delivered.
    pub async fn scan_once(&mut self) -> Result<usize> {
        let window = self
            .watermark
            .checked_add_signed(self.settings.quantum)
            .zip(self.watermark.checked_sub_signed(self.settings.grace));
        let Some((to, from)) = window else {
            return Err(Error::Config(format!(
                "poll window around {} with quantum {} and grace {} is out of range",
                self.watermark, self.settings.quantum, self.settings.grace
            )));
        };

        let store = &self.store;
        let strategy = Exponential::from_millis(
            SCAN_RETRY_BASE_MS,
            SCAN_RETRY_MAX_MS,
            2.0,
            0.1,
            Some(SCAN_RETRY_ATTEMPTS),
        );
        let rows = Retry::retry(
            strategy,
            move || store.query_by_time_range(from, to),
            |e: &Error| !e.is_fatal(),
        )
        .await?;

        let dedup = self.settings.grace > chrono::TimeDelta::zero();
        let mut sent = 0;
        for row in rows {
            if dedup && self.delivered.contains_key(&row.row_key) {
                continue;
            }
            debug!(row_key = row.row_key, user_id = row.point.user_id, "Sending stored point");
            if let Err(e) = self.sink.publish(&row.point) {
                warn!(?e, row_key = row.row_key, "Sink rejected stored point");
            }
            sent += 1;
            if dedup {
                self.delivered.insert(row.row_key, row.timestamp);
            }
        }

        let now = (self.clock)();
        self.watermark = self.watermark.max(to.min(now));
        if dedup {
            // rows at or below the next lower bound cannot come back
            let floor = self
                .watermark
                .checked_sub_signed(self.settings.grace)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            self.delivered.retain(|_, ts| *ts > floor);
        }
        Ok(sent)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            watermark = %self.watermark,
            quantum = %self.settings.quantum,
            grace = %self.settings.grace,
            "Windowed poll source started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            let sent = self.scan_once().await?;
            debug!(sent, watermark = %self.watermark, "Poll cycle done");
        }
        info!(watermark = %self.watermark, "Windowed poll source stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use parking_lot::Mutex;

    use super::*;
    use crate::point::RoutePoint;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        received: Arc<Mutex<Vec<RoutePoint>>>,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    fn harness(settings: PollSettings) -> (Harness, WindowedPollSource) {
        let store = Arc::new(MemoryStore::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let now = Arc::new(Mutex::new(Utc::now()));

        let sink_received = Arc::clone(&received);
        let sink = move |point: &RoutePoint| -> Result<()> {
            sink_received.lock().push(point.clone());
            Ok(())
        };
        let clock_now = Arc::clone(&now);
        let source = WindowedPollSource::with_clock(
            settings,
            Arc::clone(&store) as Arc<dyn RoutePointStore>,
            Arc::new(sink),
            Arc::new(move || *clock_now.lock()),
        );
        (
            Harness {
                store,
                received,
                now,
            },
            source,
        )
    }

    fn point(user: &str) -> RoutePoint {
        RoutePoint::new(user, 47.6, -122.3, Utc::now())
    }

    #[tokio::test]
    async fn watermark_advances_by_quantum_until_now() {
        let settings = PollSettings {
            lookback: TimeDelta::seconds(35),
            ..Default::default()
        };
        let (harness, mut source) = harness(settings);
        let now = *harness.now.lock();
        let initial = source.watermark();
        assert_eq!(initial, now - TimeDelta::seconds(35));

        for cycle in 1..=6 {
            source.scan_once().await.unwrap();
            let expected = (initial + TimeDelta::seconds(10 * cycle)).min(now);
            assert_eq!(source.watermark(), expected);
            assert!(source.watermark() <= now);
        }
        assert_eq!(source.watermark(), now);
    }

    #[tokio::test]
    async fn window_point_delivered_exactly_once() {
        let (harness, mut source) = harness(PollSettings::default());
        let watermark = source.watermark();
        harness
            .store
            .insert_at(point("1"), watermark + TimeDelta::seconds(10));
        harness
            .store
            .insert_at(point("2"), watermark + TimeDelta::seconds(15));
        // on the exclusive lower bound, never delivered
        harness.store.insert_at(point("3"), watermark);

        assert_eq!(source.scan_once().await.unwrap(), 1);
        assert_eq!(source.scan_once().await.unwrap(), 1);
        for _ in 0..5 {
            assert_eq!(source.scan_once().await.unwrap(), 0);
        }
        let users: Vec<_> = harness
            .received
            .lock()
            .iter()
            .map(|p| p.user_id.clone())
            .collect();
        assert_eq!(users, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn late_write_is_skipped_without_grace() {
        let (harness, mut source) = harness(PollSettings::default());
        let start = source.watermark();
        source.scan_once().await.unwrap();
        harness.store.insert_at(point("late"), start + TimeDelta::seconds(5));
        source.scan_once().await.unwrap();
        assert!(harness.received.lock().is_empty());
    }

    #[tokio::test]
    async fn grace_window_catches_late_write_once() {
        let settings = PollSettings {
            grace: TimeDelta::seconds(10),
            ..Default::default()
        };
        let (harness, mut source) = harness(settings);
        let start = source.watermark();
        harness
            .store
            .insert_at(point("early"), start + TimeDelta::seconds(8));

        assert_eq!(source.scan_once().await.unwrap(), 1);
        harness.store.insert_at(point("late"), start + TimeDelta::seconds(5));
        // the rescanned overlap holds "early" again but it is not redelivered
        assert_eq!(source.scan_once().await.unwrap(), 1);
        assert_eq!(source.scan_once().await.unwrap(), 0);

        let users: Vec<_> = harness
            .received
            .lock()
            .iter()
            .map(|p| p.user_id.clone())
            .collect();
        assert_eq!(users, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn oversized_durations_fail_without_panicking() {
        let (_, source) = harness(PollSettings {
            lookback: TimeDelta::MAX,
            ..Default::default()
        });
        assert_eq!(source.watermark(), DateTime::<Utc>::MIN_UTC);

        let (harness, mut source) = harness(PollSettings {
            quantum: TimeDelta::MAX,
            ..Default::default()
        });
        let before = source.watermark();
        let result = source.scan_once().await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(source.watermark(), before);
        assert_eq!(harness.store.queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_are_retried() {
        let (harness, mut source) = harness(PollSettings::default());
        let start = source.watermark();
        harness.store.insert_at(point("1"), start + TimeDelta::seconds(1));
        harness.store.fail_queries(2);

        assert_eq!(source.scan_once().await.unwrap(), 1);
        assert_eq!(harness.store.queries(), 3);
        assert_eq!(source.watermark(), start + TimeDelta::seconds(10));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_store_failure_propagates_from_run() {
        let (harness, source) = harness(PollSettings::default());
        let start = source.watermark();
        harness.store.insert_at(point("1"), start + TimeDelta::seconds(1));
        harness.store.fail_queries(usize::MAX);

        let result = source.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(harness.store.queries(), 1 + SCAN_RETRY_ATTEMPTS as usize);
        assert!(harness.received.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_cancelled() {
        let (harness, source) = harness(PollSettings::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(harness.store.queries(), 3);
    }
}
