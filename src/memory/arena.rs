//! The heap's single bounded virtual range.
//!
//! Reserved once at heap construction and never resized. All allocator
//! memory lives inside it, split into fixed `PAGE_SIZE` pages that are handed
//! out by an atomic cursor and never returned to the arena: a page belongs to
//! the view created for it for the lifetime of the heap.

use std::ptr::NonNull;

use crate::memory::compact::{self, CompactPtr, MAX_ENCODABLE_LEN};
use crate::memory::stats::HeapStats;
use crate::memory::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};

/// Size of one heap page: the unit of commit, decommit and view ownership.
pub const PAGE_SIZE: usize = 16 * 1024;

pub struct Arena {
    /// PAGE_SIZE-aligned start of the reservation.
    base: NonNull<u8>,
    len: usize,
    page_count: usize,
    next_page: AtomicUsize,
    stats: HeapStats,
    #[cfg(test)]
    fail_decommits: AtomicUsize,
}

// Safety: the arena only hands out raw addresses; every mutation of shared
// state goes through atomics or the VM layer.
unsafe impl Send for Arena {}
// Safety: see above.
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve `reserved_bytes` (rounded down to whole pages) of address
    /// space. Nothing is committed yet.
    pub fn new(reserved_bytes: usize) -> Result<Self, VmError> {
        let len = reserved_bytes / PAGE_SIZE * PAGE_SIZE;
        if len == 0 {
            return Err(VmError::InitializationFailed(format!(
                "arena of {reserved_bytes} bytes is smaller than one {PAGE_SIZE}-byte page"
            )));
        }
        if len > MAX_ENCODABLE_LEN {
            return Err(VmError::InitializationFailed(format!(
                "arena of {len} bytes exceeds the compact pointer range \
                 of {MAX_ENCODABLE_LEN} bytes"
            )));
        }
        let os_page = PlatformVmOps::page_size();
        if !PAGE_SIZE.is_multiple_of(os_page) {
            return Err(VmError::InitializationFailed(format!(
                "heap page size {PAGE_SIZE} is not a multiple of the OS page size {os_page}"
            )));
        }

        // Safety: non-zero, page-multiple length and alignment.
        let base = unsafe { PlatformVmOps::reserve(len, PAGE_SIZE)? };
        log::trace!(
            "segheap: reserved arena {:p}+{len:#x} ({} pages)",
            base.as_ptr(),
            len / PAGE_SIZE
        );

        Ok(Self {
            base,
            len,
            page_count: len / PAGE_SIZE,
            next_page: AtomicUsize::new(0),
            stats: HeapStats::default(),
            #[cfg(test)]
            fail_decommits: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Pages handed out so far. Every index below this has a view (or is
    /// about to have one installed by the thread that claimed it).
    #[inline]
    pub fn pages_in_use(&self) -> usize {
        self.next_page.load(Ordering::Acquire).min(self.page_count)
    }

    #[inline]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr - base < self.len
    }

    /// Index of the page holding `ptr`, or `None` for a foreign pointer.
    #[inline]
    pub fn page_of(&self, ptr: *const u8) -> Option<usize> {
        self.contains(ptr)
            .then(|| (ptr as usize - self.base.as_ptr() as usize) / PAGE_SIZE)
    }

    #[inline]
    pub fn page_base(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.page_count, "page {index} out of range");
        // Safety: index < page_count keeps the offset inside the arena.
        unsafe { self.base.add(index * PAGE_SIZE) }
    }

    /// Hand out the next never-used page, or `None` once the arena is
    /// exhausted.
    pub fn claim_page(&self) -> Option<usize> {
        let mut next = self.next_page.load(Ordering::Relaxed);
        loop {
            if next >= self.page_count {
                return None;
            }
            match self.next_page.compare_exchange_weak(
                next,
                next + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => next = actual,
            }
        }
    }

    /// Back page `index` with physical memory. Kernel call; callers must not
    /// hold any view lock.
    pub fn commit_page(&self, index: usize) -> Result<(), VmError> {
        // Safety: the page lies inside our reservation.
        unsafe { PlatformVmOps::commit(self.page_base(index), PAGE_SIZE)? };
        self.stats.pages_committed.incr();
        self.stats.committed_bytes.add(PAGE_SIZE);
        log::trace!("segheap: committed page {index}");
        Ok(())
    }

    /// Return page `index`'s physical memory to the OS, keeping the range
    /// reserved.
    pub fn decommit_page(&self, index: usize) -> Result<(), VmError> {
        #[cfg(test)]
        if self
            .fail_decommits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VmError::DecommitFailed(std::io::Error::other(
                "injected decommit failure",
            )));
        }

        // Safety: the page lies inside our reservation.
        unsafe { PlatformVmOps::decommit(self.page_base(index), PAGE_SIZE)? };
        self.stats.pages_decommitted.incr();
        self.stats.committed_bytes.sub(PAGE_SIZE);
        Ok(())
    }

    /// Make the next `count` decommits fail.
    #[cfg(test)]
    pub(crate) fn inject_decommit_failures(&self, count: usize) {
        self.fail_decommits.store(count, Ordering::Relaxed);
    }

    /// Encode `ptr` relative to this arena.
    ///
    /// # Panics
    /// If `ptr` lies outside the arena or is not `MIN_ALIGN`-aligned.
    #[inline]
    pub fn encode<T>(&self, ptr: NonNull<T>) -> CompactPtr<T> {
        compact::encode(self.base, self.len, ptr)
    }

    #[inline]
    pub fn decode<T>(&self, compact: CompactPtr<T>) -> Option<NonNull<T>> {
        compact::decode(self.base, compact)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: the reservation came from `reserve` with this length and
        // alignment, and nothing references the arena any more.
        if let Err(e) = unsafe { PlatformVmOps::release(self.base, self.len, PAGE_SIZE) } {
            log::warn!("segheap: failed to release arena {:p}: {e}", self.base.as_ptr());
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::compact::MIN_ALIGN;

    #[test]
    fn test_base_is_page_aligned() {
        let arena = Arena::new(8 * PAGE_SIZE).unwrap();
        assert_eq!(arena.base().as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(arena.page_count(), 8);
        assert_eq!(arena.len(), 8 * PAGE_SIZE);
    }

    #[test]
    fn test_size_rounds_down_to_pages() {
        let arena = Arena::new(3 * PAGE_SIZE + 100).unwrap();
        assert_eq!(arena.page_count(), 3);
    }

    #[test]
    fn test_too_small_is_rejected() {
        assert!(matches!(
            Arena::new(PAGE_SIZE - 1),
            Err(VmError::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_claim_until_exhausted() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let claimed: Vec<_> = std::iter::from_fn(|| arena.claim_page()).collect();
        assert_eq!(claimed, vec![0, 1, 2, 3]);
        assert_eq!(arena.claim_page(), None);
        assert_eq!(arena.pages_in_use(), 4);
    }

    #[test]
    fn test_commit_write_decommit() {
        let arena = Arena::new(2 * PAGE_SIZE).unwrap();
        let page = arena.claim_page().unwrap();
        arena.commit_page(page).unwrap();
        let p = arena.page_base(page);
        // Safety: Test code. Page was just committed.
        unsafe {
            p.as_ptr().write_bytes(0x5a, PAGE_SIZE);
            assert_eq!(*p.as_ptr().add(PAGE_SIZE - 1), 0x5a);
        }
        assert_eq!(arena.stats().committed_bytes.get(), PAGE_SIZE);

        arena.decommit_page(page).unwrap();
        let snap = arena.stats().snapshot();
        assert_eq!(snap.pages_committed, 1);
        assert_eq!(snap.pages_decommitted, 1);
        assert_eq!(snap.committed_bytes, 0);
    }

    #[test]
    fn test_injected_decommit_failure() {
        let arena = Arena::new(PAGE_SIZE).unwrap();
        arena.commit_page(0).unwrap();
        arena.inject_decommit_failures(1);
        assert!(matches!(arena.decommit_page(0), Err(VmError::DecommitFailed(_))));
        assert_eq!(arena.stats().committed_bytes.get(), PAGE_SIZE);
        arena.decommit_page(0).unwrap();
    }

    #[test]
    fn test_page_of_and_contains() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let inside = arena.page_base(2).as_ptr().wrapping_add(100);
        assert_eq!(arena.page_of(inside), Some(2));
        assert!(arena.contains(arena.base().as_ptr()));

        let end = arena.base().as_ptr().wrapping_add(arena.len());
        assert!(!arena.contains(end));
        assert_eq!(arena.page_of(end), None);
        let local = 0u64;
        assert!(!arena.contains(std::ptr::from_ref(&local).cast()));
    }

    #[test]
    fn test_codec_roundtrip_every_granule_of_a_page() {
        let arena = Arena::new(2 * PAGE_SIZE).unwrap();
        let page = arena.page_base(1);
        for offset in (0..PAGE_SIZE).step_by(MIN_ALIGN) {
            let p = NonNull::new(page.as_ptr().wrapping_add(offset)).unwrap();
            assert_eq!(arena.decode(arena.encode(p)), Some(p));
        }
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn test_encode_foreign_pointer_panics() {
        let arena = Arena::new(PAGE_SIZE).unwrap();
        let mut local = [0u128; 1];
        let _ = arena.encode(NonNull::from(&mut local[0]));
    }
}
