//! Fixed-size carbonlink connection pool.
//!
//! ## Slot lifecycle
//!
//! ```text
//!             borrow (TTL ok)              query ok
//!   Ready ─────────────────────▶ Borrowed ───────────▶ Ready (front)
//!     │                             │
//!     │ borrow (TTL expired)        │ query failed
//!     ▼                             ▼
//!   PendingRefresh ──invalid──▶ PendingReconnect ◀──┐
//!     │                             │   │  still    │
//!     │ valid                       │   └──dead─────┘
//!     ▼                             │ redialed
//!   Ready (back)                    ▼
//!                                 Ready (front)
//! ```
//!
//! Every slot's state tag lives next to the ready-queue under one mutex, so
//! a key can never sit in two places at once. The slot's own data has a
//! separate lock that only its current owner touches.
//!
//! Two background threads do the repair work so `query` never waits on a
//! dial: the refresh loop revalidates slots whose TTL expired, and the
//! reconnect loop redials dead slots with linear backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Carbonlink;
use crate::config::PoolConfig;
use crate::conn::WireConnection;
use crate::points::Points;
use crate::error::ConfigError;
use crate::protocol::Codec;
use crate::slot::{Slot, SlotState};

/// Message on a repair channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repair {
    Slot(usize),
    Shutdown,
}

/// Ready-queue plus the state tag of every slot.
#[derive(Debug)]
struct Roster {
    ready: VecDeque<usize>,
    states: Vec<SlotState>,
    closed: bool,
}

impl Roster {
    fn transition(&mut self, key: usize, from: SlotState, to: SlotState) {
        debug_assert_eq!(
            self.states[key], from,
            "slot {key} expected {from}, found {}",
            self.states[key]
        );
        self.states[key] = to;
    }
}

/// Point-in-time count of slots per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    /// Keys currently in the ready-queue. Always equals `ready`.
    pub queued: usize,
    pub ready: usize,
    pub borrowed: usize,
    pub pending_refresh: usize,
    pub pending_reconnect: usize,
}

struct Shared {
    slots: Vec<Mutex<Slot>>,
    roster: Mutex<Roster>,
    refresh_tx: Sender<Repair>,
    refresh_rx: Receiver<Repair>,
    reconnect_tx: Sender<Repair>,
    reconnect_rx: Receiver<Repair>,
    empty: Arc<Points>,
}

/// Carbonlink connection pool.
///
/// Queries never fail: when no healthy connection is available the shared
/// [`Points::unavailable`] sentinel is returned instead.
pub struct Pool {
    shared: Arc<Shared>,
    address: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Build a pool speaking `config.codec`. Every slot is dialed up front;
    /// a failed dial still yields a slot, just a dead one.
    pub fn new(config: &PoolConfig) -> Result<Self, ConfigError> {
        Self::with_codec(config, config.codec.codec())
    }

    /// Pool of `size` connections to `address` with default settings.
    pub fn with_address(address: impl Into<String>, size: usize) -> Result<Self, ConfigError> {
        let config = PoolConfig {
            address: address.into(),
            size,
            ..Default::default()
        };
        Self::new(&config)
    }

    /// Like [`Pool::new`] with a caller-supplied codec. `config.codec` is
    /// ignored. Fails if `config` does not pass [`PoolConfig::validate`].
    pub fn with_codec(config: &PoolConfig, codec: Arc<dyn Codec>) -> Result<Self, ConfigError> {
        config.validate()?;
        let size = config.size;
        // One spare so the shutdown sentinel always fits, and so a zero-size
        // pool does not end up with a rendezvous channel.
        let (refresh_tx, refresh_rx) = bounded(size + 1);
        let (reconnect_tx, reconnect_rx) = bounded(size + 1);

        let mut slots = Vec::with_capacity(size);
        let mut ready = VecDeque::with_capacity(size);
        for key in 0..size {
            let mut conn = WireConnection::new(config.address.clone(), codec.clone());
            conn.set_timeout(config.timeout);
            conn.set_connect_timeout(config.connect_timeout);
            if let Err(e) = conn.refresh() {
                warn!(slot = key, error = %e, "Initial dial failed");
            }

            slots.push(Mutex::new(Slot::new(
                key,
                conn,
                config.valid_duration,
                config.base_retry_interval,
            )));
            ready.push_front(key);
        }

        debug!(
            addr = %config.address,
            size = size,
            "Carbonlink pool created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                slots,
                roster: Mutex::new(Roster {
                    ready,
                    states: vec![SlotState::Ready; size],
                    closed: false,
                }),
                refresh_tx,
                refresh_rx,
                reconnect_tx,
                reconnect_rx,
                empty: Arc::new(Points::unavailable()),
            }),
            address: config.address.clone(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Spawn the refresh and reconnect loops. Calling it again while they
    /// run, or after `close`, does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.shared.roster.lock().closed {
            return;
        }

        let refresh = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("carbonlink-refresh".to_string())
                .spawn(move || shared.run_refresh())
        };
        let reconnect = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("carbonlink-reconnect".to_string())
                .spawn(move || shared.run_reconnect())
        };

        for handle in [refresh, reconnect] {
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "Failed to spawn repair loop"),
            }
        }

        info!(addr = %self.address, size = self.size(), "Carbonlink pool started");
    }

    /// Stop both repair loops and close every connection.
    ///
    /// An in-flight query is not interrupted; its slot is closed once the
    /// query returns. Later queries get the empty sentinel.
    pub fn close(&self) {
        {
            let mut roster = self.shared.roster.lock();
            if roster.closed {
                return;
            }
            roster.closed = true;
        }

        let _ = self.shared.refresh_tx.try_send(Repair::Shutdown);
        let _ = self.shared.reconnect_tx.try_send(Repair::Shutdown);

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Repair loop panicked");
            }
        }

        for slot in &self.shared.slots {
            slot.lock().close();
        }
        info!(addr = %self.address, "Carbonlink pool closed");
    }

    /// Apply a new read timeout to every slot.
    pub fn set_timeout(&self, timeout: Duration) {
        for slot in &self.shared.slots {
            slot.lock().set_timeout(timeout);
        }
    }

    pub fn set_base_retry_interval(&self, interval: Duration) {
        for slot in &self.shared.slots {
            slot.lock().set_base_retry_interval(interval);
        }
    }

    /// Cached points for `metric` at `step`, or the empty sentinel.
    ///
    /// Globs and patterns are not expanded; `metric` must be a full name.
    pub fn query(&self, metric: &str, step: i64) -> Arc<Points> {
        let Some(key) = self.shared.borrow() else {
            debug!(metric = metric, "No carbonlink slot available");
            return Arc::clone(&self.shared.empty);
        };

        let result = self.shared.slots[key].lock().query(metric, step);
        match result {
            Ok(points) => {
                self.shared.give_back(key, SlotState::Borrowed);
                Arc::new(points)
            }
            Err(e) => {
                warn!(slot = key, metric = metric, error = %e, "Carbonlink query failed");
                self.shared.quarantine(key, SlotState::Borrowed);
                Arc::clone(&self.shared.empty)
            }
        }
    }

    /// The sentinel returned for degraded queries.
    pub fn empty_result(&self) -> Arc<Points> {
        Arc::clone(&self.shared.empty)
    }

    pub fn stats(&self) -> PoolStats {
        let roster = self.shared.roster.lock();
        let mut stats = PoolStats {
            size: roster.states.len(),
            queued: roster.ready.len(),
            ..Default::default()
        };
        for state in &roster.states {
            match state {
                SlotState::Ready => stats.ready += 1,
                SlotState::Borrowed => stats.borrowed += 1,
                SlotState::PendingRefresh => stats.pending_refresh += 1,
                SlotState::PendingReconnect => stats.pending_reconnect += 1,
            }
        }
        stats
    }
}

impl Carbonlink for Pool {
    fn start(&self) {
        Pool::start(self);
    }

    fn close(&self) {
        Pool::close(self);
    }

    fn set_timeout(&self, timeout: Duration) {
        Pool::set_timeout(self, timeout);
    }

    fn query(&self, metric: &str, step: i64) -> Arc<Points> {
        Pool::query(self, metric, step)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    /// Take the front ready slot, diverting any whose TTL expired to the
    /// refresh loop.
    fn borrow(&self) -> Option<usize> {
        let mut roster = self.roster.lock();
        if roster.closed {
            return None;
        }

        while let Some(key) = roster.ready.pop_front() {
            // Lock order is roster then slot. A ready slot's lock is free
            // apart from brief timeout updates.
            if self.slots[key].lock().require_validation() {
                roster.transition(key, SlotState::Ready, SlotState::PendingRefresh);
                self.dispatch(&self.refresh_tx, key, "refresh");
                continue;
            }

            roster.transition(key, SlotState::Ready, SlotState::Borrowed);
            return Some(key);
        }
        None
    }

    /// Front-insert: a slot that just worked is the best bet for the next
    /// caller.
    fn give_back(&self, key: usize, from: SlotState) {
        let mut roster = self.roster.lock();
        roster.transition(key, from, SlotState::Ready);
        roster.ready.push_front(key);
    }

    fn quarantine(&self, key: usize, from: SlotState) {
        self.roster
            .lock()
            .transition(key, from, SlotState::PendingReconnect);
        self.dispatch(&self.reconnect_tx, key, "reconnect");
    }

    /// Channels hold one more message than there are slots, so this only
    /// fails once the loops are gone.
    fn dispatch(&self, tx: &Sender<Repair>, key: usize, loop_name: &str) {
        if let Err(e) = tx.try_send(Repair::Slot(key)) {
            debug!(slot = key, repair = loop_name, error = %e, "Repair loop not accepting slots");
        }
    }

    fn run_refresh(&self) {
        debug!("Refresh loop started");
        while let Ok(Repair::Slot(key)) = self.refresh_rx.recv() {
            let valid = {
                let mut slot = self.slots[key].lock();
                slot.validation_and_refresh(false);
                slot.is_valid()
            };

            if valid {
                // Back of the queue: slots that served a query more recently
                // go first.
                let mut roster = self.roster.lock();
                roster.transition(key, SlotState::PendingRefresh, SlotState::Ready);
                roster.ready.push_back(key);
            } else {
                debug!(slot = key, "Slot failed revalidation");
                self.quarantine(key, SlotState::PendingRefresh);
            }
        }
        debug!("Refresh loop stopped");
    }

    fn run_reconnect(&self) {
        debug!("Reconnect loop started");
        let mut parked: BinaryHeap<Reverse<(Instant, usize)>> = BinaryHeap::new();

        loop {
            let next = match parked.peek() {
                Some(Reverse((deadline, _))) => self.reconnect_rx.recv_deadline(*deadline),
                None => self
                    .reconnect_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match next {
                Ok(Repair::Slot(key)) => self.try_reconnect(key, &mut parked),
                Ok(Repair::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    while let Some(&Reverse((deadline, key))) = parked.peek() {
                        if deadline > now {
                            break;
                        }
                        parked.pop();
                        self.try_reconnect(key, &mut parked);
                    }
                }
            }
        }
        debug!(parked = parked.len(), "Reconnect loop stopped");
    }

    /// One reconnect attempt, or re-park if still inside the backoff window.
    fn try_reconnect(&self, key: usize, parked: &mut BinaryHeap<Reverse<(Instant, usize)>>) {
        let mut slot = self.slots[key].lock();

        if slot.wait_retry() {
            if let Some(deadline) = slot.retry_deadline() {
                parked.push(Reverse((deadline, key)));
            }
            return;
        }

        slot.validation_and_refresh(true);
        if !slot.is_valid() {
            slot.retry();
            debug!(slot = key, attempts = slot.retry_count(), "Reconnect failed");
            if let Some(deadline) = slot.retry_deadline() {
                parked.push(Reverse((deadline, key)));
            }
            return;
        }

        if slot.retry_count() > 0 {
            info!(slot = key, attempts = slot.retry_count(), "Slot reconnected");
        }
        slot.reset_retry();
        drop(slot);
        self.give_back(key, SlotState::PendingReconnect);
    }
}
