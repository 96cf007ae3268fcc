//! Append-only route point store polled by the windowed poll source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::point::{RoutePoint, StoredRoutePoint};

/// SQLite backed store.
pub mod sqlite;

#[async_trait]
pub trait RoutePointStore: Send + Sync {
    /// Appends a point; the store assigns the row key and the timestamp.
    async fn append(&self, point: &RoutePoint) -> Result<StoredRoutePoint>;

    /// Points whose store timestamp is in `(from, to]`, in store order.
    async fn query_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredRoutePoint>>;
}

/// In-process store. Rows can also be inserted with an explicit timestamp and queries can be
/// made to fail, which makes it handy for exercising the poll source.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreState>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    rows: Vec<StoredRoutePoint>,
    next_key: u64,
    failing_queries: usize,
    queries: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a point as if the store had stamped it with `timestamp`.
    pub fn insert_at(&self, point: RoutePoint, timestamp: DateTime<Utc>) -> StoredRoutePoint {
        let mut state = self.inner.lock();
        state.next_key += 1;
        let stored = StoredRoutePoint {
            row_key: format!("{:020}", state.next_key),
            timestamp,
            point,
        };
        state.rows.push(stored.clone());
        stored
    }

    /// Makes the next `count` queries fail.
    pub fn fail_queries(&self, count: usize) {
        self.inner.lock().failing_queries = count;
    }

    /// Number of queries served so far, failed ones included.
    pub fn queries(&self) -> usize {
        self.inner.lock().queries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RoutePointStore for MemoryStore {
    async fn append(&self, point: &RoutePoint) -> Result<StoredRoutePoint> {
        Ok(self.insert_at(point.clone(), Utc::now()))
    }

    async fn query_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredRoutePoint>> {
        let mut state = self.inner.lock();
        state.queries += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(Error::Store("store unavailable".to_string()));
        }
        Ok(state
            .rows
            .iter()
            .filter(|row| row.timestamp > from && row.timestamp <= to)
            .cloned()
            .collect())
    }
}
