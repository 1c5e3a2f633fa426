use std::cell::UnsafeCell;

/// Byte storage behind a data pipe.
///
/// The pipe's mutex decides who may touch which bytes: copies into free
/// space and out of buffered space happen under the lock, while a two-phase
/// region is handed out to exactly one endpoint and stays off-limits to the
/// other until it is committed.
pub(crate) struct Ring {
    cells: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through the `unsafe` methods below, whose callers
// guarantee that concurrently live references cover disjoint byte ranges.
unsafe impl Sync for Ring {}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        UnsafeCell::raw_get(self.cells[offset..].as_ptr())
    }

    /// # Safety
    ///
    /// Nobody may write `offset..offset + len` while the slice is alive.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.capacity());
        std::slice::from_raw_parts(self.ptr_at(offset), len)
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to `offset..offset + len` while
    /// the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.capacity());
        std::slice::from_raw_parts_mut(self.ptr_at(offset), len)
    }

    /// Copy `data` in starting at `at`, wrapping past the end.
    ///
    /// # Safety
    ///
    /// The destination bytes must be free space that no reservation covers.
    pub(crate) unsafe fn write_wrapping(&self, at: usize, data: &[u8]) {
        let first = data.len().min(self.capacity() - at);
        self.slice_mut(at, first).copy_from_slice(&data[..first]);
        self.slice_mut(0, data.len() - first)
            .copy_from_slice(&data[first..]);
    }

    /// Copy `dst.len()` bytes out starting at `at`, wrapping past the end.
    ///
    /// # Safety
    ///
    /// The source bytes must be buffered data that no write can reach.
    pub(crate) unsafe fn read_wrapping(&self, at: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.capacity() - at);
        dst[..first].copy_from_slice(self.slice(at, first));
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(self.slice(0, rest));
    }
}
