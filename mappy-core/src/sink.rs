use tokio::sync::broadcast;
use tracing::info;

use crate::error::{Error, Result};
use crate::point::RoutePoint;

/// Fans a route point out to whoever is interested. Invoked once per observed point, possibly
/// from several tasks at once, and must not block indefinitely.
pub trait PointSink: Send + Sync {
    fn publish(&self, point: &RoutePoint) -> Result<()>;
}

impl<F> PointSink for F
where
    F: Fn(&RoutePoint) -> Result<()> + Send + Sync,
{
    fn publish(&self, point: &RoutePoint) -> Result<()> {
        self(point)
    }
}

/// Writes every point to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PointSink for LogSink {
    fn publish(&self, point: &RoutePoint) -> Result<()> {
        info!(
            user_id = point.user_id,
            latitude = point.latitude,
            longitude = point.longitude,
            measurement_time = %point.measurement_time,
            "Route point"
        );
        Ok(())
    }
}

/// Live fan-out to any number of subscribers. Subscribers that fall behind by more than the
/// channel capacity miss points; a publish without subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<RoutePoint>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutePoint> {
        self.sender.subscribe()
    }
}

impl PointSink for BroadcastSink {
    fn publish(&self, point: &RoutePoint) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(point.clone())
            .map(|_| ())
            .map_err(|e| Error::Sink(format!("broadcasting route point: {e}")))
    }
}
