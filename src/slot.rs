//! A pooled connection plus the health state the repair loops act on.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::conn::WireConnection;
use crate::error::LinkError;
use crate::points::Points;

/// Where a slot currently lives. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Key is in the ready-queue.
    Ready,
    /// Handed to a caller by `borrow`.
    Borrowed,
    /// Queued for (or running) a TTL revalidation.
    PendingRefresh,
    /// Queued for (or backing off before) a reconnect attempt.
    PendingReconnect,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Borrowed => write!(f, "borrowed"),
            Self::PendingRefresh => write!(f, "pending-refresh"),
            Self::PendingReconnect => write!(f, "pending-reconnect"),
        }
    }
}

pub struct Slot {
    connection: WireConnection,
    last_checked: Instant,
    valid_duration: Duration,
    retry: u32,
    retry_start: Instant,
    base_retry_interval: Duration,
    key: usize,
}

impl Slot {
    pub fn new(
        key: usize,
        connection: WireConnection,
        valid_duration: Duration,
        base_retry_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection,
            last_checked: now,
            valid_duration,
            retry: 0,
            retry_start: now,
            base_retry_interval,
            key,
        }
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn last_checked(&self) -> Instant {
        self.last_checked
    }

    pub fn retry_count(&self) -> u32 {
        self.retry
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    pub fn set_base_retry_interval(&mut self, interval: Duration) {
        self.base_retry_interval = interval;
    }

    /// True once the validity TTL has elapsed since the last check.
    pub fn require_validation(&self) -> bool {
        self.last_checked.elapsed() >= self.valid_duration
    }

    /// Revalidate the connection if due (or unconditionally when `force`),
    /// redialing when it is dead.
    ///
    /// `force` skips the liveness probe and always redials. When neither
    /// forced nor due, nothing happens and `last_checked` stays put.
    pub fn validation_and_refresh(&mut self, force: bool) {
        if !force && !self.require_validation() {
            return;
        }

        if (force || !self.connection.is_valid())
            && let Err(e) = self.connection.refresh()
        {
            debug!(slot = self.key, error = %e, "Refresh failed");
        }
        self.last_checked = Instant::now();
    }

    pub fn is_valid(&mut self) -> bool {
        self.connection.is_valid()
    }

    /// Whether the slot is still inside its backoff window.
    pub fn wait_retry(&self) -> bool {
        if self.retry == 0 {
            return false;
        }
        self.retry_start.elapsed() < self.backoff()
    }

    /// When the current backoff window closes, if the slot is backing off.
    pub fn retry_deadline(&self) -> Option<Instant> {
        if self.retry == 0 {
            return None;
        }
        Some(self.retry_start + self.backoff())
    }

    /// Record one more failed reconnect attempt.
    pub fn retry(&mut self) {
        if self.retry == 0 {
            self.retry_start = Instant::now();
        }
        self.retry += 1;
    }

    pub fn reset_retry(&mut self) {
        self.retry = 0;
    }

    /// Linear in the number of consecutive failures.
    fn backoff(&self) -> Duration {
        self.base_retry_interval.saturating_mul(self.retry)
    }

    pub fn query(&mut self, metric: &str, step: i64) -> Result<Points, LinkError> {
        self.connection.probe(metric, step)
    }

    pub fn close(&mut self) {
        self.connection.close();
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key)
            .field("connection", &self.connection)
            .field("retry", &self.retry)
            .finish()
    }
}
