//! The route point value type and its JSON wire format.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// One GPS observation for a user at a moment in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "MeasurementTime", deserialize_with = "lenient_utc")]
    pub measurement_time: DateTime<Utc>,
}

impl RoutePoint {
    pub fn new(
        user_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        measurement_time: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            latitude,
            longitude,
            measurement_time,
        }
    }

    /// Decodes and validates a wire payload.
    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        let point: RoutePoint = serde_json::from_slice(payload)
            .map_err(|e| Error::Decode(format!("invalid route point: {e}")))?;
        point.validate()?;
        Ok(point)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Decode(format!("encoding route point: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::Decode("route point without UserID".to_string()));
        }
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(Error::Decode(format!(
                "route point for {} has non-finite coordinates",
                self.user_id
            )));
        }
        Ok(())
    }
}

/// A route point as read back from the point store, with the row key and the timestamp the
/// store assigned on write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRoutePoint {
    pub row_key: String,
    pub timestamp: DateTime<Utc>,
    pub point: RoutePoint,
}

impl AsRef<RoutePoint> for StoredRoutePoint {
    fn as_ref(&self) -> &RoutePoint {
        &self.point
    }
}

/// Producers outside our control write timestamps with or without an offset; without one the
/// value is taken as UTC.
fn lenient_utc<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
