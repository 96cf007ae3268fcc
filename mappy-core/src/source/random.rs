use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RandomSettings;
use crate::error::{Error, Result};
use crate::point::RoutePoint;
use crate::sink::PointSink;

/// Downtown Seattle, where every simulated user starts out.
pub const CENTER_LATITUDE: f64 = 47.5998;
pub const CENTER_LONGITUDE: f64 = -122.3346;

/// Steps after a user's first point are this much tighter than the initial spread.
const STEP_DIVISOR: f64 = 500.0;

/// Deterministic random walk over a population of simulated users.
#[derive(Debug)]
pub struct RandomWalk {
    rng: StdRng,
    users: u32,
    max_range: f64,
    last_points: HashMap<u32, RoutePoint>,
}

impl RandomWalk {
    pub fn new(settings: &RandomSettings) -> Result<Self> {
        // users are drawn from [1, users)
        if settings.users < 2 {
            return Err(Error::Config(format!(
                "random source needs at least 2 users, got {}",
                settings.users
            )));
        }
        if !settings.max_range.is_finite() || settings.max_range <= 0.0 {
            return Err(Error::Config(format!(
                "random source max range must be positive, got {}",
                settings.max_range
            )));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(settings.seed),
            users: settings.users,
            max_range: settings.max_range,
            last_points: HashMap::new(),
        })
    }

    /// Generates the next point, stamped with `now`, and remembers it as the user's last point.
    pub fn next_point(&mut self, now: DateTime<Utc>) -> RoutePoint {
        let user = self.rng.random_range(1..self.users);
        let previous = self
            .last_points
            .get(&user)
            .map(|prev| (prev.latitude, prev.longitude));
        let (latitude, longitude) = match previous {
            Some((lat, lon)) => {
                let step = self.max_range / STEP_DIVISOR;
                (self.next_coord(lat, step), self.next_coord(lon, step))
            }
            None => {
                let range = self.max_range;
                (
                    self.next_coord(CENTER_LATITUDE, range),
                    self.next_coord(CENTER_LONGITUDE, range),
                )
            }
        };
        let point = RoutePoint::new(user.to_string(), latitude, longitude, now);
        self.last_points.insert(user, point.clone());
        point
    }

    fn next_coord(&mut self, center: f64, range: f64) -> f64 {
        center + self.rng.random::<f64>() * range - range / 2.0
    }
}

/// Emits one random-walk point per delay interval until cancelled.
pub struct RandomWalkSource {
    walk: RandomWalk,
    delay: Duration,
    sink: Arc<dyn PointSink>,
}

impl RandomWalkSource {
    pub fn new(settings: &RandomSettings, sink: Arc<dyn PointSink>) -> Result<Self> {
        Ok(Self {
            walk: RandomWalk::new(settings)?,
            delay: settings.delay,
            sink,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(delay = ?self.delay, users = self.walk.users, "Random route point source started");
        while !cancel.is_cancelled() {
            let point = self.walk.next_point(Utc::now());
            debug!(?point, "Generated route point");
            if let Err(e) = self.sink.publish(&point) {
                warn!(?e, user_id = point.user_id, "Sink rejected generated point");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        info!("Random route point source stopped");
        Ok(())
    }
}
