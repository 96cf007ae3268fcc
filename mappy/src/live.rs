use std::io::Write;

use mappy_core::RoutePoint;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// What live subscribers receive for every observed point. Coordinates are narrowed to `f32`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LiveUpdate {
    pub(crate) user_id: String,
    pub(crate) lat: f32,
    pub(crate) lon: f32,
}

impl From<&RoutePoint> for LiveUpdate {
    fn from(point: &RoutePoint) -> Self {
        Self {
            user_id: point.user_id.clone(),
            lat: point.latitude as f32,
            lon: point.longitude as f32,
        }
    }
}

/// Writes one JSON line per received point until cancelled or the sink goes away.
pub(crate) async fn forward<W: Write>(
    mut rx: broadcast::Receiver<RoutePoint>,
    mut out: W,
    cancel: CancellationToken,
) {
    loop {
        let point = tokio::select! {
            _ = cancel.cancelled() => return,
            point = rx.recv() => point,
        };
        let point = match point {
            Ok(point) => point,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Live feed is behind, dropped route points");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let written = serde_json::to_writer(&mut out, &LiveUpdate::from(&point))
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            error!(?e, "Writing live feed");
            return;
        }
    }
}
