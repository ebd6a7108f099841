// src/table.rs
use std::sync::Mutex;

use crate::conn::HttpConn;

/// Fixed-capacity connection table indexed by fd.
///
/// Every slot is preallocated at startup; memory is traded for O(1) lookup
/// and zero allocator traffic per connection. Slot reuse is safe because a
/// slot is fully reset on init and its generation counter advances, so
/// anything still holding a reference to the previous occupant (a stale
/// timer, a late work item) can detect the swap.
pub struct ConnTable {
    slots: Box<[Mutex<HttpConn>]>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Mutex<HttpConn>> =
            (0..capacity).map(|_| Mutex::new(HttpConn::new())).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The slot for a fd, or `None` when the fd exceeds the table.
    #[inline]
    pub fn slot(&self, fd: i32) -> Option<&Mutex<HttpConn>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }
}
