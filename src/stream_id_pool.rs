//! Stream id allocation (§4.2). A stack of free ids sized to the
//! negotiated protocol version's capacity (128 for v1-v2, 32,768 for
//! v3+). Kept as a plain `Vec` rather than a bitset (§9 Design Notes,
//! "Connection capacity under v3+") since the free list only ever holds
//! ids that are *not* in use, so it's already sparse relative to the
//! in-flight set.

use crate::protocol::version::ProtocolVersion;

pub struct StreamIdPool {
    free: Vec<i16>,
    capacity: usize,
}

impl StreamIdPool {
    pub fn new(version: ProtocolVersion) -> Self {
        let mut pool = Self {
            free: Vec::new(),
            capacity: 0,
        };
        pool.set_version(version);
        pool
    }

    /// Allocate the next free stream id, or `None` if the pool is exhausted
    /// (the caller should append to `pendingWrites` per §4.5 `sendStream`).
    pub fn pop(&mut self) -> Option<i16> {
        self.free.pop()
    }

    /// Return a stream id to the free pool once its frame has arrived
    /// (§4.4 `frameEnded`).
    pub fn push(&mut self, id: i16) {
        debug_assert!((id as usize) < self.capacity, "stream id out of range");
        self.free.push(id);
    }

    /// Empty the free list, e.g. as part of connection close's
    /// `clearAndInvokePending` (§4.5).
    pub fn clear(&mut self) {
        self.free.clear();
    }

    /// Re-seed the free list for a newly negotiated protocol version,
    /// invalidating whatever was previously free (§4.2).
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.capacity = version.stream_id_capacity();
        self.free = (0..self.capacity).rev().map(|id| id as i16).collect();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids currently checked out, i.e. not sitting in the free pool.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn v2_capacity_is_128() {
        let pool = StreamIdPool::new(ProtocolVersion::V2);
        assert_eq!(pool.capacity(), 128);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn v4_capacity_is_32768() {
        let mut pool = StreamIdPool::new(ProtocolVersion::V4);
        assert_eq!(pool.capacity(), 32_768);
        let mut ids = Vec::new();
        while let Some(id) = pool.pop() {
            ids.push(id);
        }
        assert_eq!(ids.len(), 32_768);
        assert!(pool.pop().is_none());
    }

    #[test]
    fn pushed_id_is_reusable() {
        let mut pool = StreamIdPool::new(ProtocolVersion::V2);
        let id = pool.pop().unwrap();
        assert_eq!(pool.in_use(), 1);
        pool.push(id);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn set_version_reseeds_capacity() {
        let mut pool = StreamIdPool::new(ProtocolVersion::V1);
        pool.pop();
        pool.set_version(ProtocolVersion::V4);
        assert_eq!(pool.capacity(), 32_768);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn clear_empties_free_list() {
        let mut pool = StreamIdPool::new(ProtocolVersion::V2);
        pool.clear();
        assert_eq!(pool.pop(), None);
    }
}
