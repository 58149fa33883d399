//! Buffer ownership and mapping
//!
//! This module wraps backend-allocated memory blocks behind an ownership
//! discipline: an [`OwnedBuffer`] is exclusively owned by whichever component
//! currently holds it and transfers by move, never by duplication. Mapping is
//! scoped and tracked so that unmapping and release happen exactly once on
//! every exit path.
//!
//! # Ownership variants
//!
//! - An owning buffer releases its allocation on drop.
//! - A borrowed view (e.g. a buffer lent out of a backend-owned sample) never
//!   releases; converting it to an owned buffer requires an explicit
//!   [`OwnedBuffer::deep_copy`].
//!
//! # Main Types
//!
//! - [`BufferMemory`] - Contract required from the backend's allocation and
//!   mapping primitives
//! - [`HeapMemory`] - Process-heap implementation, used for deep copies and
//!   in tests
//! - [`OwnedBuffer`] - The ownership wrapper itself

use crate::error::{FramelinkError, Result};

/// Contract required from the backend's buffer allocation/mapping primitives
///
/// A failing `map` call indicates a resource-lifecycle bug and is surfaced as
/// a fatal [`FramelinkError::Buffer`], never retried. `data`/`data_mut` are
/// only called between a successful `map` and the matching `unmap`.
pub trait BufferMemory: Send {
    /// Size of the underlying block in bytes
    fn size(&self) -> usize;

    /// Map the block for reading, or for writing when `writable` is true
    fn map(&mut self, writable: bool) -> Result<()>;

    /// Unmap a previously mapped block
    fn unmap(&mut self);

    /// Access the mapped bytes
    fn data(&self) -> &[u8];

    /// Access the mapped bytes mutably (requires a writable mapping)
    fn data_mut(&mut self) -> &mut [u8];

    /// Release the underlying allocation back to its allocator
    fn release(&mut self);
}

/// Process-heap memory block
///
/// Used for deep copies of delivered buffers and as the allocation behind
/// test buffers. Mapping is a no-op bookkeeping step; release drops the
/// storage.
#[derive(Debug, Default)]
pub struct HeapMemory {
    bytes: Vec<u8>,
}

impl HeapMemory {
    /// Create a heap block from existing bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Create a zeroed heap block of the given size
    pub fn zeroed(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }
}

impl BufferMemory for HeapMemory {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn map(&mut self, _writable: bool) -> Result<()> {
        Ok(())
    }

    fn unmap(&mut self) {}

    fn data(&self) -> &[u8] {
        &self.bytes
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn release(&mut self) {
        self.bytes = Vec::new();
    }
}

/// Mapping state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Not mapped
    Unmapped,
    /// Mapped for reading
    Read,
    /// Mapped for writing
    Write,
}

/// Ownership wrapper around a backend-allocated memory block
///
/// Move-only. Dropping an `OwnedBuffer` unmaps it if mapped, then releases
/// the allocation iff the buffer owns it.
pub struct OwnedBuffer {
    memory: Box<dyn BufferMemory>,
    owns_memory: bool,
    map_state: MapState,
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("size", &self.memory.size())
            .field("owns_memory", &self.owns_memory)
            .field("map_state", &self.map_state)
            .finish()
    }
}

impl OwnedBuffer {
    /// Wrap a memory block, taking ownership of the allocation
    pub fn new(memory: Box<dyn BufferMemory>) -> Self {
        Self {
            memory,
            owns_memory: true,
            map_state: MapState::Unmapped,
        }
    }

    /// Wrap a memory block as a borrowed view that never releases
    pub fn borrowed(memory: Box<dyn BufferMemory>) -> Self {
        Self {
            memory,
            owns_memory: false,
            map_state: MapState::Unmapped,
        }
    }

    /// Create an owning buffer over a heap copy of the given bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Box::new(HeapMemory::new(bytes.into())))
    }

    /// Size of the underlying block in bytes
    pub fn len(&self) -> usize {
        self.memory.size()
    }

    /// Whether the underlying block is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this buffer releases its allocation on drop
    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    /// Current mapping state
    pub fn map_state(&self) -> MapState {
        self.map_state
    }

    /// Map the buffer for reading and return the mapped bytes
    ///
    /// Idempotent: an existing read or write mapping is reused.
    pub fn map_read(&mut self) -> Result<&[u8]> {
        if self.map_state == MapState::Unmapped {
            self.memory
                .map(false)
                .map_err(|e| FramelinkError::Buffer(format!("read mapping failed: {e}")))?;
            self.map_state = MapState::Read;
        }
        Ok(self.memory.data())
    }

    /// Map the buffer for writing and return the mapped bytes
    ///
    /// A live read mapping is unmapped first; an existing write mapping is
    /// reused.
    pub fn map_write(&mut self) -> Result<&mut [u8]> {
        if self.map_state != MapState::Write {
            if self.map_state == MapState::Read {
                self.unmap();
            }
            self.memory
                .map(true)
                .map_err(|e| FramelinkError::Buffer(format!("write mapping failed: {e}")))?;
            self.map_state = MapState::Write;
        }
        Ok(self.memory.data_mut())
    }

    /// Unmap the buffer if mapped
    pub fn unmap(&mut self) {
        if self.map_state != MapState::Unmapped {
            self.memory.unmap();
            self.map_state = MapState::Unmapped;
        }
    }

    /// Produce an owning heap copy of this buffer's contents
    ///
    /// Used to convert a borrowed view into an owned buffer so the lender's
    /// slot is released as soon as possible. The source is left unmapped.
    pub fn deep_copy(&mut self) -> Result<OwnedBuffer> {
        let copy = {
            let data = self.map_read()?;
            data.to_vec()
        };
        self.unmap();
        Ok(OwnedBuffer::from_bytes(copy))
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        self.unmap();
        if self.owns_memory {
            self.memory.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Memory block that records map/unmap/release calls
    struct CountingMemory {
        bytes: Vec<u8>,
        maps: Arc<AtomicU32>,
        unmaps: Arc<AtomicU32>,
        releases: Arc<AtomicU32>,
        fail_map: bool,
    }

    impl CountingMemory {
        fn new(bytes: Vec<u8>) -> (Self, Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
            let maps = Arc::new(AtomicU32::new(0));
            let unmaps = Arc::new(AtomicU32::new(0));
            let releases = Arc::new(AtomicU32::new(0));
            (
                Self {
                    bytes,
                    maps: maps.clone(),
                    unmaps: unmaps.clone(),
                    releases: releases.clone(),
                    fail_map: false,
                },
                maps,
                unmaps,
                releases,
            )
        }
    }

    impl BufferMemory for CountingMemory {
        fn size(&self) -> usize {
            self.bytes.len()
        }

        fn map(&mut self, _writable: bool) -> Result<()> {
            if self.fail_map {
                return Err(FramelinkError::Buffer("mapping refused".into()));
            }
            self.maps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unmap(&mut self) {
            self.unmaps.fetch_add(1, Ordering::SeqCst);
        }

        fn data(&self) -> &[u8] {
            &self.bytes
        }

        fn data_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_map_read_idempotent() {
        let (mem, maps, _, _) = CountingMemory::new(vec![1, 2, 3]);
        let mut buf = OwnedBuffer::new(Box::new(mem));

        assert_eq!(buf.map_read().unwrap(), &[1, 2, 3]);
        assert_eq!(buf.map_read().unwrap(), &[1, 2, 3]);
        assert_eq!(maps.load(Ordering::SeqCst), 1);
        assert_eq!(buf.map_state(), MapState::Read);
    }

    #[test]
    fn test_map_write_remaps_from_read() {
        let (mem, maps, unmaps, _) = CountingMemory::new(vec![0; 4]);
        let mut buf = OwnedBuffer::new(Box::new(mem));

        buf.map_read().unwrap();
        buf.map_write().unwrap()[0] = 7;

        // read mapping was torn down before the write mapping
        assert_eq!(unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(maps.load(Ordering::SeqCst), 2);
        assert_eq!(buf.map_state(), MapState::Write);
        assert_eq!(buf.map_read().unwrap()[0], 7);
    }

    #[test]
    fn test_drop_unmaps_then_releases_owned() {
        let (mem, _, unmaps, releases) = CountingMemory::new(vec![0; 4]);
        let mut buf = OwnedBuffer::new(Box::new(mem));
        buf.map_read().unwrap();
        drop(buf);

        assert_eq!(unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrowed_view_never_releases() {
        let (mem, _, unmaps, releases) = CountingMemory::new(vec![0; 4]);
        let mut buf = OwnedBuffer::borrowed(Box::new(mem));
        buf.map_read().unwrap();
        drop(buf);

        assert_eq!(unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_map_failure_is_fatal_buffer_error() {
        let (mut mem, _, _, _) = CountingMemory::new(vec![0; 4]);
        mem.fail_map = true;
        let mut buf = OwnedBuffer::new(Box::new(mem));

        let err = buf.map_read().unwrap_err();
        assert!(matches!(err, FramelinkError::Buffer(_)));
        assert_eq!(buf.map_state(), MapState::Unmapped);
    }

    #[test]
    fn test_deep_copy_owns_and_matches() {
        let (mem, _, _, _) = CountingMemory::new(vec![9, 8, 7]);
        let mut view = OwnedBuffer::borrowed(Box::new(mem));
        let mut copy = view.deep_copy().unwrap();

        assert!(copy.owns_memory());
        assert_eq!(copy.map_read().unwrap(), &[9, 8, 7]);
        // the source ends up unmapped
        assert_eq!(view.map_state(), MapState::Unmapped);
    }
}
