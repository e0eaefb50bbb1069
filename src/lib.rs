//! Client-side connection pool for carbonlink, the request/reply protocol
//! carbon-cache uses to serve datapoints it has not yet written to disk.
//!
//! Callers ask for a metric at a step and get back a [`Points`] series.
//! Queries never block indefinitely and never error: if no healthy
//! connection is available the result is the [`Points::unavailable`]
//! sentinel (`step == 0`).
//!
//! ## Usage
//!
//! ```no_run
//! use carbonlink_pool::{Pool, PoolConfig};
//!
//! # fn main() -> Result<(), carbonlink_pool::ConfigError> {
//! let pool = Pool::new(&PoolConfig::from_env())?;
//! pool.start();
//!
//! let points = pool.query("carbon.agents.host-a.cpuUsage", 60);
//! if points.is_unavailable() {
//!     eprintln!("carbonlink degraded");
//! }
//! for (bucket, value) in &points.datapoints {
//!     println!("{bucket} {value}");
//! }
//!
//! pool.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod points;
pub mod pool;
pub mod protocol;
pub mod single;
pub mod slot;

use std::sync::Arc;
use std::time::Duration;

pub use config::PoolConfig;
pub use conn::WireConnection;
pub use error::{CodecError, ConfigError, LinkError};
pub use points::Points;
pub use pool::{Pool, PoolStats};
pub use protocol::{Codec, CodecKind, MsgpackCodec, PickleCodec, Reply, Request};
pub use single::SingleLink;

/// What callers need from a carbonlink client, pooled or not.
pub trait Carbonlink: Send + Sync {
    /// Begin any background maintenance.
    fn start(&self);

    /// Stop maintenance and close connections. Later queries return the
    /// unavailable sentinel.
    fn close(&self);

    /// Read timeout for each request/reply cycle.
    fn set_timeout(&self, timeout: Duration);

    /// Cached points for `metric` bucketed by `step` seconds.
    fn query(&self, metric: &str, step: i64) -> Arc<Points>;
}
