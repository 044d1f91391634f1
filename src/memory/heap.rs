//! The heap context: one arena, its page table, size classes, directory and
//! the registry of thread caches feeding from them.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::memory::arena::Arena;
use crate::memory::compact::{CompactPtr, MIN_ALIGN};
use crate::memory::config::HeapConfig;
use crate::memory::directory::Directory;
use crate::memory::error::AllocError;
use crate::memory::size_class::{Route, SizeClass, SizeClassTable};
use crate::memory::stats::{HeapStatsSnapshot, ViewCensus};
use crate::memory::thread_cache::{self, CacheSlot};
use crate::memory::view::{PageTable, View};
use crate::memory::vm::VmError;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::handle::Arc;
use crate::sync::{Mutex, OnceLock};

crate::sync::loom_static! {
    static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);
}

pub(crate) struct HeapShared {
    pub(crate) id: u64,
    pub(crate) config: HeapConfig,
    pub(crate) classes: SizeClassTable,
    pub(crate) directory: Directory,
    pub(crate) pages: PageTable,
    pub(crate) arena: Arena,
    caches: Mutex<Vec<Arc<CacheSlot>>>,
}

impl HeapShared {
    fn new(config: HeapConfig) -> Result<Self, VmError> {
        config.validate()?;
        let arena = Arena::new(config.reserved_bytes)?;
        let classes = SizeClassTable::build(config.max_object_size, config.bitfit_max_size);
        let directory = Directory::new(&classes, arena.page_count());
        let pages = PageTable::new(arena.page_count());
        log::debug!(
            "segheap: heap over {} pages, {} size classes up to {} bytes",
            arena.page_count(),
            classes.len(),
            classes.max_size()
        );
        Ok(Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            classes,
            directory,
            pages,
            arena,
            caches: Mutex::new(Vec::new()),
        })
    }

    /// Page index and view of an address inside the arena.
    #[inline]
    pub(crate) fn view_of(&self, ptr: NonNull<u8>) -> Option<(usize, &View)> {
        let page = self.arena.page_of(ptr.as_ptr())?;
        Some((page, self.pages.get(page)?))
    }

    fn allocate_class(self: &Arc<Self>, class: &SizeClass) -> Result<NonNull<u8>, AllocError> {
        thread_cache::with_thread_cache(self, |cache| match cache {
            Some(cache) => cache.allocate(self, class),
            None => self.allocate_uncached(class),
        })
    }

    fn allocate_uncached(&self, class: &SizeClass) -> Result<NonNull<u8>, AllocError> {
        let mut out = None;
        self.directory
            .claim(&self.arena, &self.pages, class, 1, |ptr| out = Some(ptr))?;
        out.ok_or(AllocError::OutOfMemory { size: class.size })
    }

    /// # Safety
    /// `ptr` is a live allocation of this heap.
    unsafe fn deallocate(self: &Arc<Self>, ptr: NonNull<u8>) {
        let Some((page, view)) = self.view_of(ptr) else {
            panic!("{ptr:p} was not allocated by this heap");
        };
        thread_cache::with_thread_cache(self, |cache| {
            // Safety: forwarded from the caller.
            let cached = cache.is_some_and(|cache| unsafe { cache.free(self, page, view, ptr) });
            if !cached {
                self.arena.stats().remote_frees.incr();
                // Safety: forwarded from the caller.
                unsafe { self.directory.free(self.arena.base(), page, view, ptr) };
            }
        });
    }

    /// Register a new thread cache. Slots of exited threads and flushed
    /// caches are dropped here too, so the registry stays bounded by the
    /// number of live registrations even without a scavenger.
    pub(crate) fn register_cache(&self, slot: Arc<CacheSlot>) {
        let mut caches = self.lock_caches();
        caches.retain(|slot| !slot.is_retired());
        caches.push(slot);
    }

    #[cfg(test)]
    pub(crate) fn cache_count(&self) -> usize {
        self.lock_caches().len()
    }

    /// Snapshot of the registered caches, dropping retired ones.
    pub(crate) fn registered_caches(&self) -> Vec<Arc<CacheSlot>> {
        let mut caches = self.lock_caches();
        caches.retain(|slot| !slot.is_retired());
        caches.clone()
    }

    fn lock_caches(&self) -> crate::sync::MutexGuard<'_, Vec<Arc<CacheSlot>>> {
        self.caches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A segregated size-class heap.
///
/// Cloning is cheap and yields another handle to the same heap. The arena is
/// released when the last handle (including a running
/// [`Scavenger`](crate::Scavenger)) is dropped.
#[derive(Clone)]
pub struct Heap(Arc<HeapShared>);

impl Heap {
    /// Heap with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the arena cannot be reserved.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(HeapConfig::default())
    }

    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` for an invalid configuration
    /// and `VmError::ReservationFailed` if the arena cannot be reserved.
    pub fn with_config(config: HeapConfig) -> Result<Self, VmError> {
        Ok(Self(Arc::new(HeapShared::new(config)?)))
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<HeapShared> {
        &self.0
    }

    /// Allocate `size` bytes aligned to at least 16.
    ///
    /// # Errors
    ///
    /// `AllocError::LargeObject` above the largest size class,
    /// `AllocError::OutOfMemory` once the arena is exhausted and
    /// `AllocError::Commit` if the OS refuses to back a page.
    #[inline]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_aligned(size, MIN_ALIGN)
    }

    /// Allocate memory for `layout`, honouring its alignment.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    #[inline]
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.allocate_aligned(layout.size(), layout.align().max(MIN_ALIGN))
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        match self.0.classes.route(size, align) {
            Route::Segregated(index) => self.0.allocate_class(self.0.classes.get(index)),
            Route::Large => Err(AllocError::LargeObject { size, align }),
        }
    }

    /// Free an allocation of this heap, from any thread.
    ///
    /// # Safety
    /// `ptr` was returned by [`allocate`](Self::allocate) or
    /// [`allocate_layout`](Self::allocate_layout) on this heap and has not
    /// been freed since.
    ///
    /// # Panics
    ///
    /// If `ptr` does not belong to this heap. In debug builds, also on a
    /// double free.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // Safety: forwarded from the caller.
        unsafe { self.0.deallocate(ptr) }
    }

    /// Return the calling thread's cached objects to their views.
    pub fn flush_thread_cache(&self) {
        thread_cache::flush_thread_cache(&self.0);
    }

    /// Whether `ptr` lies inside this heap's arena.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.0.arena.contains(ptr)
    }

    /// Usable size of the live allocation at `ptr`, or `None` for a pointer
    /// outside this heap.
    ///
    /// # Panics
    ///
    /// If `ptr` is inside the heap but not the start of a live bitfit object.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let (_, view) = self.0.view_of(ptr)?;
        Some(match view {
            View::Exclusive(v) => v.object_size(),
            View::Bitfit(v) => v.usable_size(self.0.arena.base(), ptr),
        })
    }

    /// Compact 4-byte handle for `ptr`, relative to this heap's arena.
    ///
    /// # Panics
    ///
    /// If `ptr` lies outside the arena or is not 16-byte aligned.
    #[inline]
    pub fn encode(&self, ptr: NonNull<u8>) -> CompactPtr<u8> {
        self.0.arena.encode(ptr)
    }

    /// Pointer for a handle from [`encode`](Self::encode). The null handle
    /// decodes to `None`.
    #[inline]
    pub fn decode(&self, compact: CompactPtr<u8>) -> Option<NonNull<u8>> {
        self.0.arena.decode(compact)
    }

    pub fn stats(&self) -> HeapStatsSnapshot {
        self.0.arena.stats().snapshot()
    }

    /// Views by state. Decommitted views are counted apart from the EMPTY
    /// ones.
    pub fn census(&self) -> ViewCensus {
        self.0.directory.census(&self.0.arena, &self.0.pages)
    }

    pub fn size_classes(&self) -> &[SizeClass] {
        self.0.classes.classes()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.0.config
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.0.directory.assert_consistent(&self.0.arena, &self.0.pages);
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.0.id)
            .field("base", &self.0.arena.base())
            .field("reserved", &self.0.arena.len())
            .field("pages_in_use", &self.0.arena.pages_in_use())
            .field("page_count", &self.0.arena.page_count())
            .finish_non_exhaustive()
    }
}

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

/// Process-wide heap, configured once.
pub struct GlobalHeap;

impl GlobalHeap {
    /// Configure the global heap with an arena of `reserved_bytes` and
    /// default settings otherwise.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the global heap is already
    /// configured, or any error from [`Heap::with_config`].
    pub fn configure_arena(reserved_bytes: usize) -> Result<(), VmError> {
        Self::configure(HeapConfig {
            reserved_bytes,
            ..HeapConfig::default()
        })
    }

    /// # Errors
    ///
    /// As [`configure_arena`](Self::configure_arena).
    pub fn configure(config: HeapConfig) -> Result<(), VmError> {
        let configured =
            || VmError::InitializationFailed("global heap is already configured".to_string());
        if GLOBAL_HEAP.get().is_some() {
            return Err(configured());
        }
        GLOBAL_HEAP
            .set(Heap::with_config(config)?)
            .map_err(|_| configured())
    }

    /// Returns the configured global heap.
    ///
    /// # Panics
    ///
    /// Panics if the global heap has not been configured.
    pub fn get() -> &'static Heap {
        GLOBAL_HEAP.get().expect("GlobalHeap not configured")
    }

    /// # Errors
    ///
    /// As [`Heap::allocate`].
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::get().allocate(size)
    }

    /// # Safety
    /// As [`Heap::deallocate`], against the global heap.
    pub unsafe fn deallocate(ptr: NonNull<u8>) {
        // Safety: forwarded from the caller.
        unsafe { Self::get().deallocate(ptr) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::arena::PAGE_SIZE;
    use crate::memory::size_class::ViewKind;

    fn small_heap(pages: usize) -> Heap {
        Heap::with_config(HeapConfig {
            reserved_bytes: pages * PAGE_SIZE,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_allocate_is_writable_and_aligned() {
        let heap = small_heap(32);
        for size in [0, 1, 15, 16, 17, 64, 100, 129, 1000, 4000, 8192] {
            let p = heap.allocate(size).unwrap();
            assert!(heap.contains(p.as_ptr()));
            assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
            let usable = heap.size_of(p).unwrap();
            assert!(usable >= size.max(1), "{size} got {usable}");
            // Safety: Test code.
            unsafe {
                p.as_ptr().write_bytes(0xcd, usable);
                heap.deallocate(p);
            }
        }
        heap.flush_thread_cache();
        heap.assert_consistent();
    }

    #[test]
    fn test_layout_alignment() {
        let heap = small_heap(32);
        for align in [16, 32, 64, 128, 256, 512] {
            let layout = Layout::from_size_align(align + 16, align).unwrap();
            let p = heap.allocate_layout(layout).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }
        // Below the heap's minimum is rounded up.
        let p = heap.allocate_layout(Layout::from_size_align(3, 1).unwrap()).unwrap();
        assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
        // Safety: Test code.
        unsafe { heap.deallocate(p) };
    }

    #[test]
    fn test_large_object_routing() {
        let heap = small_heap(8);
        let max = heap.config().max_object_size;
        match heap.allocate(max + 1) {
            Err(AllocError::LargeObject { size, align }) => {
                assert_eq!((size, align), (max + 1, MIN_ALIGN));
            }
            other => panic!("expected large object, got {other:?}"),
        }
        let over_aligned = Layout::from_size_align(64, 2 * PAGE_SIZE).unwrap();
        assert!(heap.allocate_layout(over_aligned).unwrap_err().is_large_object());
        assert_eq!(heap.stats().pages_committed, 0, "routing never touches the arena");
    }

    #[test]
    fn test_size_classes_exposed() {
        let heap = small_heap(8);
        let classes = heap.size_classes();
        assert_eq!(classes.first().unwrap().size, 16);
        assert_eq!(classes.last().unwrap().size, 8192);
        assert!(classes.iter().take_while(|c| c.size <= 64).all(|c| c.kind == ViewKind::Bitfit));
    }

    #[test]
    #[should_panic(expected = "not allocated by this heap")]
    fn test_foreign_pointer_panics() {
        let heap = small_heap(8);
        let mut local = [0u128; 2];
        // Safety: Test code. Deliberately foreign.
        unsafe { heap.deallocate(NonNull::from(&mut local).cast()) };
    }

    #[test]
    fn test_compact_handles() {
        let heap = small_heap(8);
        let p = heap.allocate(640).unwrap();
        let handle = heap.encode(p);
        assert!(!handle.is_null());
        assert_eq!(heap.decode(handle), Some(p));
        assert_eq!(heap.decode(CompactPtr::NULL), None);
        // Safety: Test code.
        unsafe { heap.deallocate(p) };
    }

    #[test]
    fn test_size_of_foreign_is_none() {
        let heap = small_heap(8);
        let local = 0u128;
        assert_eq!(heap.size_of(NonNull::from(&local).cast()), None);
    }

    #[test]
    fn test_heaps_are_independent() {
        let a = small_heap(8);
        let b = small_heap(8);
        let p = a.allocate(300).unwrap();
        assert!(a.contains(p.as_ptr()));
        assert!(!b.contains(p.as_ptr()));
        let q = b.allocate(300).unwrap();
        // Safety: Test code.
        unsafe {
            a.deallocate(p);
            b.deallocate(q);
        }
        a.flush_thread_cache();
        b.flush_thread_cache();
        assert_eq!(a.census().partial, 0);
        assert_eq!(b.census().partial, 0);
    }

    #[test]
    fn test_out_of_memory() {
        let heap = small_heap(2);
        let mut held = Vec::new();
        let err = loop {
            match heap.allocate(8192) {
                Ok(p) => held.push(p),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, AllocError::OutOfMemory { size: 8192 }));
        assert_eq!(held.len(), 4);
        for p in held {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Heap::with_config(HeapConfig {
            max_object_size: PAGE_SIZE,
            ..HeapConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, VmError::InitializationFailed(_)));
    }

    #[test]
    fn test_global_heap_configures_once() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // Other tests never touch the global heap, so the first configure
        // here wins and any later one fails.
        let first = GlobalHeap::configure_arena(64 * PAGE_SIZE);
        if first.is_ok() {
            assert!(GlobalHeap::configure_arena(64 * PAGE_SIZE).is_err());
        }
        let p = GlobalHeap::allocate(48).unwrap();
        assert!(GlobalHeap::get().contains(p.as_ptr()));
        // Safety: Test code.
        unsafe { GlobalHeap::deallocate(p) };
    }
}
