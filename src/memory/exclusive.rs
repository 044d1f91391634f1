//! Exclusive views: one size class per page, no view lock.
//!
//! Occupancy is owned by the status word. A claim first reserves slots by
//! raising `live` with a CAS, then takes that many slots from the free list
//! or the bump cursor. A free pushes the slot before lowering `live`, so a
//! reservation always has a slot to take.

use std::fmt;
use std::ptr::NonNull;

use crate::memory::arena::PAGE_SIZE;
#[cfg(debug_assertions)]
use crate::memory::bitmap::AtomicBitmap;
#[cfg(debug_assertions)]
use crate::memory::compact::MIN_ALIGN;
use crate::memory::freelist::{Chain, FreeList};
use crate::memory::size_class::SizeClass;
use crate::memory::view::{StatusWord, Transition, ViewStatus};
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::sync::hint;

/// Outcome of [`ExclusiveView::reserve`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reservation {
    Claimed { count: u32, transition: Transition },
    Full,
    /// A decommit or recommit is in flight.
    Busy,
    /// The page has been handed to another class.
    OtherClass,
    Decommitted,
}

pub(crate) struct ExclusiveView {
    page: usize,
    // The class fields only change under the busy mark with no live slots,
    // and are published by the status CAS that clears it.
    class: AtomicUsize,
    object_size: AtomicU32,
    capacity: AtomicU32,
    status: StatusWord,
    free: FreeList,
    /// Slots at or above this index have not been handed out since the page
    /// was last committed.
    bump: AtomicU32,
    /// Slots currently handed out (to a user or a thread cache). Sized for
    /// the smallest class, since the view may be rebound.
    #[cfg(debug_assertions)]
    live_map: AtomicBitmap,
}

#[allow(clippy::cast_possible_truncation)]
fn class_shape(class: &SizeClass) -> (u32, u32) {
    (class.size as u32, class.objects_per_page as u32)
}

impl ExclusiveView {
    pub(crate) fn new(page: usize, class: &SizeClass) -> Self {
        let (object_size, capacity) = class_shape(class);
        Self {
            page,
            class: AtomicUsize::new(class.index),
            object_size: AtomicU32::new(object_size),
            capacity: AtomicU32::new(capacity),
            status: StatusWord::new(ViewStatus::INITIAL),
            free: FreeList::new((page + 1) * PAGE_SIZE),
            bump: AtomicU32::new(0),
            #[cfg(debug_assertions)]
            live_map: AtomicBitmap::new(PAGE_SIZE / MIN_ALIGN),
        }
    }

    #[inline]
    pub(crate) fn page(&self) -> usize {
        self.page
    }

    #[inline]
    pub(crate) fn class(&self) -> usize {
        self.class.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn object_size(&self) -> usize {
        self.object_size.load(Ordering::Relaxed) as usize
    }

    #[inline]
    fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn status(&self) -> ViewStatus {
        self.status.load()
    }

    #[inline]
    fn page_base(&self, base: NonNull<u8>) -> NonNull<u8> {
        // Safety: `page` was handed out by the arena at `base`.
        unsafe { base.add(self.page * PAGE_SIZE) }
    }

    /// Claim up to `want` slots for class `class`.
    ///
    /// The class is checked against each status word the CAS works from, so
    /// a claim never lands on a page that was rebound after the caller picked
    /// it.
    pub(crate) fn reserve(&self, class: usize, want: u32) -> Reservation {
        debug_assert!(want > 0);
        let mut capacity = 0;
        let mut refusal = Reservation::Full;
        let result = self.status.update(|s| {
            if s.is_busy() {
                refusal = Reservation::Busy;
                return None;
            }
            if self.class() != class {
                refusal = Reservation::OtherClass;
                return None;
            }
            if !s.is_committed() {
                refusal = Reservation::Decommitted;
                return None;
            }
            capacity = self.capacity();
            let free = capacity - s.live();
            if free == 0 {
                refusal = Reservation::Full;
                return None;
            }
            Some(s.with_live(s.live() + want.min(free), capacity))
        });
        match result {
            Ok((before, after)) => Reservation::Claimed {
                count: after.live() - before.live(),
                transition: Transition { before, after },
            },
            Err(_) => refusal,
        }
    }

    /// Take one slot covered by an earlier successful [`reserve`](Self::reserve).
    ///
    /// # Safety
    /// The caller holds an unspent reservation on this view and `base` is the
    /// arena base.
    pub(crate) unsafe fn take_slot(&self, base: NonNull<u8>) -> NonNull<u8> {
        let page_base = self.page_base(base);
        let capacity = self.capacity();
        let object_size = self.object_size();
        loop {
            // Safety: every slot on the list was pushed against `base`.
            if let Some(slot) = unsafe { self.free.pop(base) } {
                let index = self.slot_index(page_base, slot);
                self.mark_live(index);
                return slot;
            }

            let mut index = self.bump.load(Ordering::Relaxed);
            while index < capacity {
                match self.bump.compare_exchange_weak(
                    index,
                    index + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.mark_live(index as usize);
                        // Safety: index < capacity keeps the slot inside the page.
                        return unsafe { page_base.add(index as usize * object_size) };
                    }
                    Err(actual) => index = actual,
                }
            }

            // Reserved but nothing visible yet: a concurrent pop holds the
            // list head.
            hint::spin_loop();
        }
    }

    /// Return one slot to the view.
    ///
    /// # Safety
    /// `ptr` is a live slot of this view and `base` is the arena base.
    pub(crate) unsafe fn free(&self, base: NonNull<u8>, ptr: NonNull<u8>) -> Transition {
        let index = self.slot_index(self.page_base(base), ptr);
        self.mark_free(index, ptr);
        // Safety: the slot is ours until pushed.
        unsafe { self.free.push(base, ptr) };
        self.release(1)
    }

    /// Return a detached thread-cache chain, all of this view's slots, with
    /// one list CAS and one status CAS.
    ///
    /// # Safety
    /// Every slot of `chain` is a live slot of this view.
    pub(crate) unsafe fn free_chain(&self, base: NonNull<u8>, chain: Chain) -> Transition {
        #[cfg(debug_assertions)]
        {
            let page_base = self.page_base(base);
            for slot in chain.slots(base) {
                let index = self.slot_index(page_base, slot);
                self.mark_free(index, slot);
            }
        }
        // Safety: the chain is linked and owned by the caller.
        unsafe { self.free.push_chain(base, chain.first, chain.last) };
        self.release(chain.count)
    }

    fn release(&self, n: u32) -> Transition {
        let capacity = self.capacity();
        self.status.modify(|s| {
            assert!(
                s.live() >= n,
                "occupancy underflow on page {}: releasing {n} of {} live",
                self.page,
                s.live()
            );
            s.with_live(s.live() - n, capacity)
        })
    }

    /// Mark an empty, committed, idle view busy for decommit.
    pub(crate) fn try_begin_decommit(&self) -> bool {
        self.status
            .update(|s| {
                (s.live() == 0 && s.is_committed() && !s.is_busy()).then(|| s.with_busy(true))
            })
            .is_ok()
    }

    /// Mark a decommitted, idle view busy for recommit.
    pub(crate) fn try_begin_recommit(&self) -> bool {
        self.status
            .update(|s| (!s.is_committed() && !s.is_busy()).then(|| s.with_busy(true)))
            .is_ok()
    }

    /// Drop all slot bookkeeping so the page can be decommitted. Requires the
    /// busy mark taken by [`try_begin_decommit`](Self::try_begin_decommit).
    pub(crate) fn reset_slots(&self) {
        debug_assert!(self.status().is_busy() && self.status().live() == 0);
        self.free.reset();
        self.bump.store(0, Ordering::Release);
        #[cfg(debug_assertions)]
        debug_assert!(self.live_map.is_clear(), "empty view still has live slots");
    }

    /// Point an idle view at `class`, dropping its slot bookkeeping. Requires
    /// the busy mark; claimers see the new class once it is cleared.
    pub(crate) fn bind(&self, class: &SizeClass) {
        self.reset_slots();
        let (object_size, capacity) = class_shape(class);
        self.class.store(class.index, Ordering::Relaxed);
        self.object_size.store(object_size, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Record whether the page under a busy view is committed, for a view
    /// taking over a page from a view of the other kind.
    pub(crate) fn adopt(&self, committed: bool) {
        self.status.modify(|s| {
            debug_assert!(s.is_busy() && s.live() == 0);
            s.with_committed(committed)
        });
    }

    /// Clear the busy mark, recording whether the page is now committed.
    pub(crate) fn end_busy(&self, committed: bool) -> Transition {
        self.status.modify(|s| {
            debug_assert!(s.is_busy());
            s.with_busy(false).with_committed(committed)
        })
    }

    #[inline]
    fn slot_index(&self, page_base: NonNull<u8>, slot: NonNull<u8>) -> usize {
        let offset = (slot.as_ptr() as usize).wrapping_sub(page_base.as_ptr() as usize);
        let object_size = self.object_size();
        let index = offset / object_size;
        assert!(
            index < self.capacity() as usize,
            "slot {slot:p} outside page {} (corrupted free list)",
            self.page
        );
        debug_assert!(
            offset.is_multiple_of(object_size),
            "{slot:p} is not a slot start in page {}",
            self.page
        );
        index
    }

    #[inline]
    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    fn mark_live(&self, index: usize) {
        #[cfg(debug_assertions)]
        {
            let was_live = self.live_map.set(index);
            assert!(!was_live, "slot {index} of page {} handed out twice", self.page);
        }
    }

    #[inline]
    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    fn mark_free(&self, index: usize, ptr: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let was_live = self.live_map.clear(index);
            assert!(was_live, "double free of {ptr:p} (page {})", self.page);
        }
    }
}

impl fmt::Debug for ExclusiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveView")
            .field("page", &self.page)
            .field("class", &self.class())
            .field("object_size", &self.object_size())
            .field("capacity", &self.capacity())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::arena::Arena;
    use crate::memory::freelist::LocalFreeList;
    use crate::memory::size_class::SizeClassTable;
    use crate::memory::view::ViewState;
    use std::collections::HashSet;

    fn committed_view(arena: &Arena, class_size: usize) -> ExclusiveView {
        let table = SizeClassTable::build(8192, 0);
        let class = *table.get(table.class_for(class_size, 16).unwrap());
        let page = arena.claim_page().unwrap();
        let view = ExclusiveView::new(page, &class);
        assert!(view.try_begin_recommit());
        arena.commit_page(page).unwrap();
        view.end_busy(true);
        view
    }

    fn claim(view: &ExclusiveView, base: NonNull<u8>, want: u32) -> Vec<NonNull<u8>> {
        match view.reserve(view.class(), want) {
            // Safety: Test code. Reservation held.
            Reservation::Claimed { count, .. } => {
                (0..count).map(|_| unsafe { view.take_slot(base) }).collect()
            }
            other => panic!("reserve failed: {other:?}"),
        }
    }

    #[test]
    fn test_new_view_is_not_committed() {
        let table = SizeClassTable::build(8192, 0);
        let class = table.get(10);
        let view = ExclusiveView::new(0, class);
        assert!(matches!(view.reserve(class.index, 1), Reservation::Decommitted));
        assert_eq!(view.status().state(), ViewState::Empty);
    }

    #[test]
    fn test_fill_to_full_and_drain_to_empty() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 2192);
        assert_eq!(view.capacity(), 7);

        let slots = claim(&view, base, 100);
        assert_eq!(slots.len(), 7, "a claim never exceeds capacity");
        assert_eq!(view.status().state(), ViewState::Full);
        assert!(matches!(view.reserve(view.class(), 1), Reservation::Full));

        let unique: HashSet<_> = slots.iter().collect();
        assert_eq!(unique.len(), 7);
        for s in &slots {
            let offset = s.as_ptr() as usize - view.page_base(base).as_ptr() as usize;
            assert_eq!(offset % 2192, 0);
            assert!(offset < PAGE_SIZE);
        }

        let mut transitions = Vec::new();
        for s in slots {
            // Safety: Test code.
            let t = unsafe { view.free(base, s) };
            if t.changed_state() {
                transitions.push((t.before.state(), t.after.state()));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (ViewState::Full, ViewState::Partial),
                (ViewState::Partial, ViewState::Empty)
            ]
        );
        assert_eq!(view.status().live(), 0);
    }

    #[test]
    fn test_freed_slots_are_reused_before_bump() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 256);

        let first = claim(&view, base, 4);
        // Safety: Test code.
        unsafe { view.free(base, first[2]) };
        let again = claim(&view, base, 1);
        assert_eq!(again[0], first[2], "free list is consulted first");
        assert_eq!(view.status().live(), 4);
    }

    #[test]
    fn test_free_chain_returns_batch() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 512);
        let slots = claim(&view, base, 8);

        let mut local = LocalFreeList::new(arena.len());
        for s in &slots[..5] {
            // Safety: Test code.
            unsafe { local.push(base, *s) };
        }
        // Safety: Test code.
        let t = unsafe { view.free_chain(base, local.take().unwrap()) };
        assert_eq!(t.before.live(), 8);
        assert_eq!(t.after.live(), 3);

        let reused: HashSet<_> = claim(&view, base, 5).into_iter().collect();
        let expected: HashSet<_> = slots[..5].iter().copied().collect();
        assert_eq!(reused, expected);
    }

    #[test]
    fn test_decommit_cycle() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 2048);

        let slots = claim(&view, base, 2);
        assert!(!view.try_begin_decommit(), "live objects block decommit");
        for s in slots {
            // Safety: Test code.
            unsafe { view.free(base, s) };
        }

        assert!(view.try_begin_decommit());
        assert!(matches!(view.reserve(view.class(), 1), Reservation::Busy));
        assert!(!view.try_begin_decommit(), "already busy");
        view.reset_slots();
        arena.decommit_page(view.page()).unwrap();
        view.end_busy(false);
        assert!(!view.status().is_committed());
        assert!(matches!(view.reserve(view.class(), 1), Reservation::Decommitted));

        assert!(view.try_begin_recommit());
        arena.commit_page(view.page()).unwrap();
        view.end_busy(true);
        let again = claim(&view, base, 1);
        assert_eq!(again[0], view.page_base(base), "bump restarts at slot 0");
        // Safety: Test code. Page recommitted.
        unsafe { again[0].as_ptr().write_bytes(0xab, 2048) };
    }

    #[test]
    fn test_bind_changes_slot_shape() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 2192);
        let old = view.class();
        for s in claim(&view, base, 3) {
            // Safety: Test code.
            unsafe { view.free(base, s) };
        }

        let table = SizeClassTable::build(8192, 0);
        let class = *table.get(table.class_for(160, 16).unwrap());
        assert!(view.try_begin_decommit());
        view.bind(&class);
        view.end_busy(true);

        assert!(matches!(view.reserve(old, 1), Reservation::OtherClass));
        assert_eq!(view.capacity() as usize, class.objects_per_page);
        let slots = claim(&view, base, 4);
        let page_base = view.page_base(base).as_ptr() as usize;
        let offsets: Vec<_> = slots.iter().map(|p| p.as_ptr() as usize - page_base).collect();
        assert_eq!(offsets, vec![0, 160, 320, 480], "bump restarts with the new stride");
        assert_eq!(view.object_size(), 160);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_detected() {
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let base = arena.base();
        let view = committed_view(&arena, 128);
        let slots = claim(&view, base, 2);
        // Safety: Test code. Deliberate double free.
        unsafe {
            view.free(base, slots[0]);
            view.free(base, slots[0]);
        }
    }

    #[test]
    fn test_concurrent_claim_and_free_never_overlaps() {
        const THREADS: usize = 4;
        let arena = Arena::new(4 * PAGE_SIZE).unwrap();
        let view = committed_view(&arena, 160);
        let base_addr = arena.base().as_ptr() as usize;
        let capacity = view.capacity() as usize;

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let view = &view;
                scope.spawn(move || {
                    let base = NonNull::new(base_addr as *mut u8).unwrap();
                    let mut held: Vec<NonNull<u8>> = Vec::new();
                    for round in 0..2000u32 {
                        let want = 1 + round % 3;
                        let reservation = view.reserve(view.class(), want);
                        if let Reservation::Claimed { count, .. } = reservation {
                            for _ in 0..count {
                                // Safety: Test code. Reservation held.
                                let p = unsafe { view.take_slot(base) };
                                // Safety: Test code. Stamp ownership into the slot.
                                unsafe { p.as_ptr().cast::<usize>().write(t) };
                                held.push(p);
                            }
                        }
                        if held.len() > capacity / THREADS || round % 5 == 0 {
                            while let Some(p) = held.pop() {
                                // Safety: Test code.
                                assert_eq!(unsafe { p.as_ptr().cast::<usize>().read() }, t);
                                // Safety: Test code.
                                unsafe { view.free(base, p) };
                            }
                        }
                    }
                    for p in held {
                        // Safety: Test code.
                        unsafe { view.free(base, p) };
                    }
                });
            }
        });

        assert_eq!(view.status().live(), 0);
        assert_eq!(view.status().state(), ViewState::Empty);
    }
}
