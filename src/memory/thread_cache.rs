//! Per-thread, per-heap allocation caches.
//!
//! A thread keeps one [`CacheSlot`] per heap it has touched. The slot is
//! registered with the heap so the scavenger can trim caches of idle
//! threads. Ownership is arbitrated by the slot's `in_use` flag: the owning
//! thread and the scavenger both take it with a CAS and neither ever waits
//! for the other. An owner that finds its slot taken goes straight to the
//! views for that call.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::memory::error::AllocError;
use crate::memory::freelist::LocalFreeList;
use crate::memory::heap::HeapShared;
use crate::memory::size_class::SizeClass;
use crate::memory::view::View;
use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::handle::{Arc, Weak};
use crate::sync::hint;

struct ClassCache {
    list: LocalFreeList,
    /// Page the list was last refilled from. Exclusive frees to this page
    /// stay local.
    active_page: Option<usize>,
}

/// The cached objects of one thread for one heap.
pub(crate) struct LocalCache {
    classes: Box<[ClassCache]>,
}

impl LocalCache {
    /// A cache for `class_count` classes of an arena of `arena_len` bytes.
    pub(crate) fn new(class_count: usize, arena_len: usize) -> Self {
        Self {
            classes: (0..class_count)
                .map(|_| ClassCache {
                    list: LocalFreeList::new(arena_len),
                    active_page: None,
                })
                .collect(),
        }
    }

    /// Objects currently cached, over all classes.
    pub(crate) fn cached(&self) -> u32 {
        self.classes.iter().map(|c| c.list.len()).sum()
    }

    /// Pop a cached object of `class`, refilling from the directory on a miss.
    pub(crate) fn allocate(
        &mut self,
        heap: &HeapShared,
        class: &SizeClass,
    ) -> Result<NonNull<u8>, AllocError> {
        let base = heap.arena.base();
        let cache = &mut self.classes[class.index];
        // Safety: the list only holds slots of this heap's arena.
        if let Some(ptr) = unsafe { cache.list.pop(base) } {
            return Ok(ptr);
        }

        let want = heap.config.batch_size_for(class.size);
        let mut first = None;
        let list = &mut cache.list;
        let claimed = heap
            .directory
            .claim(&heap.arena, &heap.pages, class, want, |ptr| {
                if first.is_none() {
                    first = Some(ptr);
                } else {
                    // Safety: freshly claimed and owned by this cache.
                    unsafe { list.push(base, ptr) };
                }
            })?;
        heap.arena.stats().cache_refills.incr();
        cache.active_page = Some(claimed.page);
        first.ok_or(AllocError::OutOfMemory { size: class.size })
    }

    /// Keep a freed object local if it belongs to the active page of an
    /// exclusive class. Returns `false` when the caller must free it to its
    /// view instead.
    ///
    /// # Safety
    /// `ptr` is a live object of `view`, which serves `page`.
    pub(crate) unsafe fn free(
        &mut self,
        heap: &HeapShared,
        page: usize,
        view: &View,
        ptr: NonNull<u8>,
    ) -> bool {
        let View::Exclusive(v) = view else {
            return false;
        };
        let cache = &mut self.classes[v.class()];
        if cache.active_page != Some(page) {
            return false;
        }
        let base = heap.arena.base();
        // Safety: the object is dead to its user and now owned by the cache.
        unsafe { cache.list.push(base, ptr) };
        if cache.list.len() > heap.config.cache_limit_for(v.object_size()) {
            if let Some(chain) = cache.list.take() {
                // Safety: every cached slot of this class came from `page`.
                let transition = unsafe { v.free_chain(base, chain) };
                heap.directory.sets_for_view(view).publish(page, view, transition);
            }
        }
        true
    }

    /// Return every cached object to its view. Returns how many were
    /// returned.
    pub(crate) fn drain(&mut self, heap: &HeapShared) -> u32 {
        let base = heap.arena.base();
        let mut returned = 0;
        for cache in &mut *self.classes {
            let Some(chain) = cache.list.take() else {
                continue;
            };
            returned += chain.count;
            let Some((page, view)) = heap.view_of(chain.first) else {
                panic!("cached slot {:p} has no view", chain.first);
            };
            match view {
                View::Exclusive(v) => {
                    // Safety: a list only holds slots of the page it was
                    // refilled from.
                    let transition = unsafe { v.free_chain(base, chain) };
                    heap.directory.sets_for_view(view).publish(page, view, transition);
                }
                View::Bitfit(_) => {
                    for slot in chain.slots(base) {
                        // Safety: each bitfit object is freed once, after
                        // its link was read.
                        unsafe { heap.directory.free(base, page, view, slot) };
                    }
                }
            }
        }
        returned
    }
}

/// A registered thread cache, shared between its owning thread and the
/// heap's scavenger.
pub(crate) struct CacheSlot {
    cache: UnsafeCell<LocalCache>,
    in_use: AtomicBool,
    /// Set by the owner on every use, cleared by each scavenger pass.
    touched: AtomicBool,
    idle_passes: AtomicU32,
    /// The owning thread is gone and the cache has been drained.
    retired: AtomicBool,
}

// Safety: `cache` is only reached through a `CacheGuard`, and at most one
// guard exists at a time (the `in_use` CAS).
unsafe impl Send for CacheSlot {}
// Safety: see above.
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    pub(crate) fn new(class_count: usize, arena_len: usize) -> Self {
        Self {
            cache: UnsafeCell::new(LocalCache::new(class_count, arena_len)),
            in_use: AtomicBool::new(false),
            touched: AtomicBool::new(true),
            idle_passes: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn try_acquire(&self) -> Option<CacheGuard<'_>> {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| CacheGuard { slot: self })
    }

    fn acquire(&self) -> CacheGuard<'_> {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            hint::spin_loop();
        }
    }

    #[inline]
    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Scavenger bookkeeping: returns how many consecutive passes the owner
    /// has left the cache alone, counting this one.
    pub(crate) fn note_pass(&self) -> u32 {
        if self.touched.swap(false, Ordering::Relaxed) {
            self.idle_passes.store(0, Ordering::Relaxed);
            0
        } else {
            self.idle_passes.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub(crate) fn reset_idle(&self) {
        self.idle_passes.store(0, Ordering::Relaxed);
    }
}

pub(crate) struct CacheGuard<'a> {
    slot: &'a CacheSlot,
}

impl CacheGuard<'_> {
    #[inline]
    pub(crate) fn cache(&mut self) -> &mut LocalCache {
        // Safety: the guard holds `in_use`.
        crate::sync::unsafe_cell_get_mut!(self.slot.cache)
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.slot.in_use.store(false, Ordering::Release);
    }
}

/// A thread's registration with one heap.
struct CacheEntry {
    heap_id: u64,
    heap: Weak<HeapShared>,
    slot: Arc<CacheSlot>,
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        // A dropped heap took its pages with it.
        if let Some(heap) = self.heap.upgrade() {
            let mut guard = self.slot.acquire();
            let returned = guard.cache().drain(&heap);
            if returned > 0 {
                log::debug!("segheap: thread exit returned {returned} cached objects");
            }
        }
        self.slot.retired.store(true, Ordering::Release);
    }
}

thread_local! {
    static THREAD_CACHES: RefCell<Vec<CacheEntry>> = const { RefCell::new(Vec::new()) };
}

/// This thread's cache slot for `heap`, registering one on first use.
/// `None` while the thread is being torn down.
fn current_slot(heap: &Arc<HeapShared>) -> Option<Arc<CacheSlot>> {
    THREAD_CACHES
        .try_with(|entries| {
            let mut entries = entries.try_borrow_mut().ok()?;
            if let Some(entry) = entries.iter().find(|e| e.heap_id == heap.id) {
                return Some(Arc::clone(&entry.slot));
            }
            entries.retain(|e| e.heap.strong_count() > 0);
            let slot = Arc::new(CacheSlot::new(heap.classes.len(), heap.arena.len()));
            heap.register_cache(Arc::clone(&slot));
            entries.push(CacheEntry {
                heap_id: heap.id,
                heap: Arc::downgrade(heap),
                slot: Arc::clone(&slot),
            });
            Some(slot)
        })
        .ok()
        .flatten()
}

/// Run `op` with this thread's cache for `heap`, or with `None` if the cache
/// is unavailable (being trimmed, or the thread is exiting).
pub(crate) fn with_thread_cache<R>(
    heap: &Arc<HeapShared>,
    op: impl FnOnce(Option<&mut LocalCache>) -> R,
) -> R {
    let slot = current_slot(heap);
    let mut guard = slot.as_deref().and_then(CacheSlot::try_acquire);
    if let Some(slot) = &slot {
        slot.touched.store(true, Ordering::Relaxed);
    }
    op(guard.as_mut().map(CacheGuard::cache))
}

/// Drain and forget this thread's cache for `heap`.
pub(crate) fn flush_thread_cache(heap: &HeapShared) {
    let removed = THREAD_CACHES
        .try_with(|entries| {
            let mut entries = entries.try_borrow_mut().ok()?;
            let index = entries.iter().position(|e| e.heap_id == heap.id)?;
            Some(entries.swap_remove(index))
        })
        .ok()
        .flatten();
    // Dropped outside the borrow: draining never re-enters the registry,
    // but a panic inside it must not poison the RefCell.
    drop(removed);
}
