//! Live channel set and id allocation for one connection.
//!
//! A single mutex guards the id→channel map; register/lookup/unregister are
//! the only operations and none of them spans I/O. Ids come from per-pool
//! monotonic counters and are never reused within a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use super::channel::{Channel, Direction};
use crate::error::RegistryError;

/// Allocation pools for connection-unique ids.
///
/// The data pool numbers channels; the rest number the correlation ids that
/// join commands to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPool {
    Data,
    Process,
    Socket,
    Accept,
    File,
}

const POOL_COUNT: i64 = 5;

pub(crate) struct IdAllocator {
    counters: [AtomicI64; POOL_COUNT as usize],
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            counters: [const { AtomicI64::new(0) }; POOL_COUNT as usize],
        }
    }

    /// Next id for the pool. Pools interleave by stride so every id is
    /// unique across the connection while each pool stays monotonic, and
    /// all allocated ids stay clear of the negative reserved range.
    pub(crate) fn next(&self, pool: IdPool) -> i64 {
        let index = pool as usize;
        let n = self.counters[index].fetch_add(1, Ordering::Relaxed);
        n * POOL_COUNT + index as i64 + 1
    }
}

pub(crate) struct Registry {
    channels: Mutex<HashMap<i64, Arc<Channel>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<Channel>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register(&self, channel: Arc<Channel>) -> Result<(), RegistryError> {
        let mut map = self.lock();
        let id = channel.id();
        if map.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        map.insert(id, channel);
        Ok(())
    }

    pub(crate) fn lookup(&self, id: i64) -> Option<Arc<Channel>> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn unregister(&self, id: i64) -> Option<Arc<Channel>> {
        self.lock().remove(&id)
    }

    /// Ids of every to-wire channel, sorted so the pump's rotation point
    /// is stable between scans.
    pub(crate) fn to_wire_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .lock()
            .values()
            .filter(|c| c.direction() == Direction::ToWire)
            .map(|c| c.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every channel, for force-close at teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<Channel>> {
        self.lock().drain().map(|(_, c)| c).collect()
    }
}
