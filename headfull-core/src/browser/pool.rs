use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, warn};

/// Allocator over a contiguous range of integer ids, used for devtools
/// ports. Every id is either available or in use, never both.
#[derive(Debug)]
pub struct ResourcePool {
    name: String,
    capacity: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    available: HashSet<u16>,
    in_use: HashSet<u16>,
}

impl ResourcePool {
    /// Builds the pool over `[base, base + capacity)`. Ids past the u16
    /// ceiling are dropped from the range with a warning, so `capacity()`
    /// reports the usable count.
    pub fn new(name: impl Into<String>, base: u16, capacity: usize) -> Self {
        let name = name.into();
        let floor = u64::from(base);
        let available: HashSet<u16> = (0..capacity)
            .map_while(|offset| u16::try_from(floor + offset as u64).ok())
            .collect();
        if available.len() < capacity {
            warn!(
                pool = %name,
                base,
                requested = capacity,
                usable = available.len(),
                "id range clipped at the u16 ceiling"
            );
        }
        let capacity = available.len();
        Self {
            name,
            capacity,
            state: Mutex::new(PoolState {
                available,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Takes an arbitrary available id, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<u16> {
        let mut state = self.state.lock().unwrap();
        let id = state.available.iter().next().copied()?;
        state.available.remove(&id);
        state.in_use.insert(id);
        debug!(
            pool = %self.name,
            id,
            available = state.available.len(),
            "resource acquired"
        );
        Some(id)
    }

    /// Returns an id to the pool. Ids that are not currently in use are
    /// ignored, so a double release cannot corrupt the range.
    pub fn release(&self, id: u16) {
        let mut state = self.state.lock().unwrap();
        if state.in_use.remove(&id) {
            state.available.insert(id);
            debug!(pool = %self.name, id, "resource released");
        } else {
            warn!(pool = %self.name, id, "released id was not in use");
        }
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().unwrap().available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
