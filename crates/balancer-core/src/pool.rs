//! Cross-worker backend directory.
//!
//! Each worker owns a [`PoolSlice`]: an append-only sequence of fixed-size
//! chunks of `(address, client-count)` rows. The owning worker is the only
//! writer; every worker (including the owner) may read any slice when
//! selecting a backend. Slot coordinates, once handed out, are never reused
//! or relocated, which is what makes unsynchronised cross-worker reads safe.
//!
//! Re-architected from a hand-rolled singly-linked chunk chain into an array
//! of atomic chunk pointers: allocating a chunk is a single
//! `compare_exchange`-guarded pointer publish, and nothing is ever freed or
//! moved while the directory is alive.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Slot has never been populated.
pub const NEVER_USED: i64 = i64::MIN;
/// Backend accepted and its port known, but no STATUS received yet.
pub const NOT_READY: i64 = -1;
/// Backend disconnected; slot remains allocated as a tombstone.
pub const DISCONNECTED: i64 = -2;

/// Upper bound on chunks per worker slice. Generous and arbitrary: not part
/// of the external contract, just large enough that a worker never runs out
/// (`MAX_CHUNKS * chunk_capacity` backends per worker over the process
/// lifetime).
const MAX_CHUNKS: usize = 4096;

#[repr(align(64))]
struct Row {
    ip: AtomicU32,
    port: AtomicU16,
    count: AtomicI64,
}

impl Row {
    fn never_used() -> Self {
        Self { ip: AtomicU32::new(0), port: AtomicU16::new(0), count: AtomicI64::new(NEVER_USED) }
    }
}

/// Coordinates of a registered backend's row within its owning worker's
/// slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub chunk: usize,
    pub index: usize,
}

/// One worker's append-only sequence of backend rows.
pub struct PoolSlice {
    chunks: Box<[AtomicPtr<Row>]>,
    chunk_capacity: usize,
    counter: AtomicU64,
}

impl PoolSlice {
    fn new(chunk_capacity: usize) -> Self {
        let chunks = (0..MAX_CHUNKS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect();
        Self { chunks, chunk_capacity, counter: AtomicU64::new(0) }
    }

    fn chunk_ptr(&self, chunk: usize) -> *mut Row {
        self.chunks[chunk].load(Ordering::Acquire)
    }

    fn alloc_chunk(&self, chunk: usize) -> *mut Row {
        let existing = self.chunk_ptr(chunk);
        if !existing.is_null() {
            return existing;
        }

        let boxed: Box<[Row]> =
            (0..self.chunk_capacity).map(|_| Row::never_used()).collect::<Vec<_>>().into();
        let ptr = Box::into_raw(boxed) as *mut Row;

        match self.chunks[chunk].compare_exchange(
            std::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => ptr,
            Err(winner) => {
                // Lost the race (can't happen with a single writer, but this
                // keeps the publish path correct if that assumption ever
                // changes). Free our extra allocation and use the winner's.
                drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, self.chunk_capacity)) });
                winner
            }
        }
    }

    /// Register a newly-accepted backend's PORT announcement, returning its
    /// slot coordinates. Must only be called by the owning worker.
    pub fn register_port(&self, ip: [u8; 4], port: u16) -> Slot {
        let counter = self.counter.load(Ordering::Relaxed);
        let chunk = counter as usize / self.chunk_capacity;
        let index = counter as usize % self.chunk_capacity;

        let chunk_ptr = if index == 0 { self.alloc_chunk(chunk) } else { self.chunk_ptr(chunk) };
        debug_assert!(!chunk_ptr.is_null());

        let row = unsafe { &*chunk_ptr.add(index) };
        row.ip.store(u32::from_ne_bytes(ip), Ordering::Relaxed);
        row.port.store(port, Ordering::Relaxed);
        row.count.store(NOT_READY, Ordering::Release);

        // Release here publishes the row writes above to any worker that
        // acquire-loads this counter, strictly before the row becomes part
        // of a selector's scan range.
        self.counter.fetch_add(1, Ordering::Release);

        Slot { chunk, index }
    }

    /// Overwrite a registered backend's client count.
    pub fn update_status(&self, slot: Slot, count: i64) {
        let Some(row) = self.row(slot) else { return };
        row.count.store(count, Ordering::Release);
    }

    /// Tombstone a backend's slot on disconnect.
    pub fn disconnect(&self, slot: Slot) {
        let Some(row) = self.row(slot) else { return };
        row.count.store(DISCONNECTED, Ordering::Release);
    }

    fn row(&self, slot: Slot) -> Option<&Row> {
        let ptr = self.chunk_ptr(slot.chunk);
        if ptr.is_null() { None } else { Some(unsafe { &*ptr.add(slot.index) }) }
    }

    fn registered(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

impl Drop for PoolSlice {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            let ptr = chunk.load(Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe {
                    Box::from_raw(std::slice::from_raw_parts_mut(ptr, self.chunk_capacity))
                });
            }
        }
    }
}

/// The full, process-wide set of per-worker slices, constructed once before
/// any worker starts and shared as an immutable-shape reference (each
/// worker only mutates the slice it owns, through that slice's interior
/// atomics).
pub struct PoolDirectory {
    slices: Vec<PoolSlice>,
}

impl PoolDirectory {
    pub fn new(workers: usize, chunk_capacity: usize) -> Self {
        Self { slices: (0..workers).map(|_| PoolSlice::new(chunk_capacity)).collect() }
    }

    pub fn slice(&self, worker: usize) -> &PoolSlice {
        &self.slices[worker]
    }

    pub fn workers(&self) -> usize {
        self.slices.len()
    }
}

/// A selected backend's address, as picked from the shared pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selected {
    pub ip: [u8; 4],
    pub port: u16,
}

/// Scan every worker's slice for the lowest non-negative client count.
/// Ties favor the lower worker index, then chunk, then slot (first seen in
/// scan order).
pub fn select_least_loaded(directory: &PoolDirectory) -> Option<Selected> {
    let mut best: Option<(i64, Selected)> = None;

    for worker in 0..directory.workers() {
        let slice = directory.slice(worker);
        let registered = slice.registered();

        for counter in 0..registered {
            let chunk = counter as usize / slice.chunk_capacity;
            let index = counter as usize % slice.chunk_capacity;
            let ptr = slice.chunk_ptr(chunk);
            if ptr.is_null() {
                continue;
            }
            let row = unsafe { &*ptr.add(index) };
            let count = row.count.load(Ordering::Acquire);
            if count < 0 {
                continue;
            }
            if best.is_none_or(|(best_count, _)| count < best_count) {
                let ip = row.ip.load(Ordering::Acquire).to_ne_bytes();
                let port = row.port.load(Ordering::Acquire);
                best = Some((count, Selected { ip, port }));
            }
        }
    }

    best.map(|(_, selected)| selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_not_ready_then_not_selectable() {
        let dir = PoolDirectory::new(1, 4);
        let slot = dir.slice(0).register_port([127, 0, 0, 1], 9000);
        assert_eq!(slot, Slot { chunk: 0, index: 0 });
        assert!(select_least_loaded(&dir).is_none());
    }

    #[test]
    fn status_makes_backend_selectable() {
        let dir = PoolDirectory::new(1, 4);
        let slot = dir.slice(0).register_port([127, 0, 0, 1], 9000);
        dir.slice(0).update_status(slot, 3);
        let selected = select_least_loaded(&dir).unwrap();
        assert_eq!(selected.port, 9000);
    }

    #[test]
    fn picks_lowest_count_across_workers() {
        let dir = PoolDirectory::new(2, 4);
        let s0 = dir.slice(0).register_port([10, 0, 0, 1], 1000);
        dir.slice(0).update_status(s0, 17);
        let s1 = dir.slice(1).register_port([10, 0, 0, 2], 2000);
        dir.slice(1).update_status(s1, 3);

        let selected = select_least_loaded(&dir).unwrap();
        assert_eq!(selected.port, 2000);
    }

    #[test]
    fn chunk_boundary_allocates_exactly_once() {
        let capacity = 4;
        let dir = PoolDirectory::new(1, capacity);
        let slice = dir.slice(0);
        for i in 0..capacity {
            let slot = slice.register_port([0, 0, 0, i as u8], 1);
            assert_eq!(slot.chunk, 0);
            assert_eq!(slot.index, i);
        }
        let overflow = slice.register_port([0, 0, 0, 99], 1);
        assert_eq!(overflow, Slot { chunk: 1, index: 0 });
    }

    #[test]
    fn disconnect_tombstones_and_excludes_from_selection() {
        let dir = PoolDirectory::new(1, 4);
        let slot = dir.slice(0).register_port([1, 2, 3, 4], 1234);
        dir.slice(0).update_status(slot, 0);
        assert!(select_least_loaded(&dir).is_some());

        dir.slice(0).disconnect(slot);
        assert!(select_least_loaded(&dir).is_none());
    }

    #[test]
    fn no_backends_returns_none() {
        let dir = PoolDirectory::new(3, 4);
        assert!(select_least_loaded(&dir).is_none());
    }
}
