//! Non-pooled carbonlink client over one connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::Carbonlink;
use crate::config::PoolConfig;
use crate::conn::WireConnection;
use crate::points::Points;
use crate::error::ConfigError;
use crate::protocol::Codec;

/// One connection shared by all callers, serialized by a mutex.
///
/// There is no background repair: a failed query redials inline, so the
/// caller after a failure pays for the reconnect.
pub struct SingleLink {
    conn: Mutex<WireConnection>,
    closed: AtomicBool,
    empty: Arc<Points>,
}

impl SingleLink {
    pub fn new(config: &PoolConfig) -> Result<Self, ConfigError> {
        Self::with_codec(config, config.codec.codec())
    }

    pub fn with_codec(config: &PoolConfig, codec: Arc<dyn Codec>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut conn = WireConnection::new(config.address.clone(), codec);
        conn.set_timeout(config.timeout);
        conn.set_connect_timeout(config.connect_timeout);
        if let Err(e) = conn.refresh() {
            warn!(error = %e, "Initial dial failed");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
            empty: Arc::new(Points::unavailable()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_connected()
    }
}

impl Carbonlink for SingleLink {
    fn start(&self) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.conn.lock().close();
    }

    fn set_timeout(&self, timeout: Duration) {
        self.conn.lock().set_timeout(timeout);
    }

    fn query(&self, metric: &str, step: i64) -> Arc<Points> {
        if self.closed.load(Ordering::SeqCst) {
            return Arc::clone(&self.empty);
        }

        let mut conn = self.conn.lock();
        if !conn.is_connected()
            && let Err(e) = conn.refresh()
        {
            debug!(error = %e, "Redial failed");
            return Arc::clone(&self.empty);
        }

        match conn.probe(metric, step) {
            Ok(points) => Arc::new(points),
            Err(e) => {
                warn!(metric = metric, error = %e, "Carbonlink query failed");
                // The stream may hold half a reply; start over next time.
                if let Err(e) = conn.refresh() {
                    debug!(error = %e, "Redial failed");
                }
                Arc::clone(&self.empty)
            }
        }
    }
}
