//! Live route point ingestion.
//!
//! A route point source observes GPS points from one of three interchangeable strategies and
//! hands every point to a [`PointSink`]:
//! - `eventhub`: a partitioned, durable event stream consumed with periodic checkpoints
//! - `tablestorage`: time windowed polling of an append-only point store
//! - `random`: a deterministic random walk over simulated users
//!
//! The [`SourceFactory`] picks one by name and the [`Supervisor`] keeps it running.

pub use self::error::{Error, Result};

mod error;

pub mod config;
pub mod generator;
pub mod point;
pub mod sink;
pub mod source;
pub mod store;
pub mod supervisor;

pub use crate::point::{RoutePoint, StoredRoutePoint};
pub use crate::sink::PointSink;
pub use crate::source::{Backends, DefaultBackends, RunningSource, SourceFactory, SourceKind};
pub use crate::supervisor::Supervisor;
