//! Handle registry.
//!
//! Tracks which camera instances are alive, keyed by device serial, how many
//! camera lists are open, and holds the single deferred system-release slot.
//!
//! ## Lock order
//!
//! serial gate, then `live`, then `deferred`; never the reverse. The per-serial
//! gate serializes open and teardown of one device, so an open never observes
//! a device half torn down and a teardown never runs under an open in flight.
//! Camera release holds `live` across the "am I the last alias" decision, the
//! native teardown and the deferred-system retry, so two aliases can never both
//! conclude they own the device.
//!
//! ## Polled acquisition
//!
//! Locks are taken with `try_lock` in a loop (yield first, then sleep for the
//! configured interval) instead of parking on the mutex. Release can be driven
//! from `Drop` on any thread, and the poller keeps such a thread from being
//! parked indefinitely behind a holder that is itself waiting on that thread.

use crate::camera::DeviceSession;
use crate::config::RegistryConfig;
use crate::system::System;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity of one camera handle object. Aliases of the same device have
/// different ids.
pub type InstanceId = u64;

#[derive(Debug, Default)]
struct SerialEntry {
    ids: BTreeSet<InstanceId>,
    session: Option<Arc<DeviceSession>>,
}

/// Live camera instances grouped by serial, plus open camera lists.
///
/// An instance counts as live from the start of its open, so the system
/// cannot be released under a device that is still being initialized.
#[derive(Debug, Default)]
pub struct LiveInstances {
    by_serial: HashMap<String, SerialEntry>,
    lists: usize,
}

impl LiveInstances {
    pub(crate) fn register(&mut self, serial: &str, id: InstanceId) {
        self.by_serial
            .entry(serial.to_string())
            .or_default()
            .ids
            .insert(id);
    }

    /// Whether another live instance shares `serial`.
    pub fn has_alias(&self, serial: &str, id: InstanceId) -> bool {
        self.by_serial
            .get(serial)
            .is_some_and(|entry| entry.ids.iter().any(|other| *other != id))
    }

    /// Remove `id`; returns whether it was registered. The device session
    /// goes with the last instance.
    pub(crate) fn remove(&mut self, serial: &str, id: InstanceId) -> bool {
        let Some(entry) = self.by_serial.get_mut(serial) else {
            return false;
        };
        let removed = entry.ids.remove(&id);
        if entry.ids.is_empty() {
            self.by_serial.remove(serial);
        }
        removed
    }

    /// Session of the initialized device behind `serial`, if one is open.
    pub(crate) fn session(&self, serial: &str) -> Option<Arc<DeviceSession>> {
        self.by_serial
            .get(serial)
            .and_then(|entry| entry.session.clone())
    }

    pub(crate) fn set_session(&mut self, serial: &str, session: Arc<DeviceSession>) {
        if let Some(entry) = self.by_serial.get_mut(serial) {
            entry.session = Some(session);
        }
    }

    pub(crate) fn open_list(&mut self) {
        self.lists += 1;
    }

    pub(crate) fn close_list(&mut self) {
        self.lists = self.lists.saturating_sub(1);
    }

    /// Whether instance `id` is registered under `serial`.
    pub fn contains(&self, serial: &str, id: InstanceId) -> bool {
        self.by_serial
            .get(serial)
            .is_some_and(|entry| entry.ids.contains(&id))
    }

    /// Live instances for one serial.
    pub fn count_for(&self, serial: &str) -> usize {
        self.by_serial.get(serial).map_or(0, |entry| entry.ids.len())
    }

    /// Total live instances across all serials.
    pub fn len(&self) -> usize {
        self.by_serial.values().map(|entry| entry.ids.len()).sum()
    }

    /// No live camera instances.
    pub fn is_empty(&self) -> bool {
        self.by_serial.is_empty()
    }

    /// Open camera lists.
    pub fn lists(&self) -> usize {
        self.lists
    }

    /// Whether anything still depends on the system instance.
    pub fn holds_system(&self) -> bool {
        !self.by_serial.is_empty() || self.lists > 0
    }

    /// Serials with at least one live instance.
    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.by_serial.keys().map(String::as_str)
    }
}

/// Process-scoped registry, injected into the system manager.
#[derive(Debug)]
pub struct HandleRegistry {
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    live: Mutex<LiveInstances>,
    deferred: Mutex<Option<Arc<System>>>,
    next_id: AtomicU64,
    spin_limit: u32,
    poll_interval: Duration,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

impl HandleRegistry {
    /// Empty registry polling its locks as `config` says.
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            live: Mutex::new(LiveInstances::default()),
            deferred: Mutex::new(None),
            next_id: AtomicU64::new(1),
            spin_limit: config.lock_spin_limit,
            poll_interval: config.poll_interval(),
        }
    }

    pub(crate) fn next_instance_id(&self) -> InstanceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open/teardown gate for `serial`, created on first use.
    pub(crate) fn serial_gate(&self, serial: &str) -> Arc<Mutex<()>> {
        poll_lock(&self.gates, self.spin_limit, self.poll_interval)
            .entry(serial.to_string())
            .or_default()
            .clone()
    }

    /// Hold a serial gate. Must be taken before `lock_live`.
    pub(crate) fn lock_gate<'a>(&self, gate: &'a Mutex<()>) -> MutexGuard<'a, ()> {
        poll_lock(gate, self.spin_limit, self.poll_interval)
    }

    /// Lock the live-instance set.
    pub(crate) fn lock_live(&self) -> MutexGuard<'_, LiveInstances> {
        poll_lock(&self.live, self.spin_limit, self.poll_interval)
    }

    /// Lock the deferred system slot. Callers holding `lock_live` may call this.
    pub(crate) fn lock_deferred(&self) -> MutexGuard<'_, Option<Arc<System>>> {
        poll_lock(&self.deferred, self.spin_limit, self.poll_interval)
    }

    /// Snapshot of the total live instance count.
    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    /// Snapshot of the live instance count for one serial.
    pub fn live_count_for(&self, serial: &str) -> usize {
        self.lock_live().count_for(serial)
    }

    /// Snapshot of the open camera list count.
    pub fn open_lists(&self) -> usize {
        self.lock_live().lists()
    }

    /// Whether a system release is parked.
    pub fn has_deferred_system(&self) -> bool {
        self.lock_deferred().is_some()
    }
}

/// Acquire `mutex` by polling `try_lock`.
fn poll_lock<T>(mutex: &Mutex<T>, spin_limit: u32, poll_interval: Duration) -> MutexGuard<'_, T> {
    let mut attempts: u32 = 0;
    loop {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        if attempts < spin_limit {
            attempts += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(poll_interval);
        }
    }
}
