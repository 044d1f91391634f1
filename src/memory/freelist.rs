//! Free lists threaded through free slots.
//!
//! Both lists link slots through the first four bytes of each free slot,
//! holding the next slot as a [`CompactPtr`] raw value (0 ends the list), so
//! a thread-local chain can be spliced onto a view's shared list as is.
//!
//! Each list has a limit, an arena offset every slot must lie below. A slot
//! outside it is a corrupted pointer and panics when it is encoded.

use std::ptr::NonNull;

use crate::memory::compact::{self, AtomicTaggedCompact, CompactPtr, TaggedCompact};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::hint;

/// Opaque marker for "a free slot"; only ever used behind compact pointers.
pub(crate) enum FreeSlot {}

#[inline]
fn encode_slot(base: NonNull<u8>, limit: usize, slot: NonNull<u8>) -> CompactPtr<FreeSlot> {
    compact::encode(base, limit, slot.cast::<FreeSlot>())
}

#[inline]
fn decode_slot(base: NonNull<u8>, raw: u32) -> Option<NonNull<u8>> {
    compact::decode(base, CompactPtr::<FreeSlot>::from_raw(raw)).map(NonNull::cast::<u8>)
}

/// The in-slot link field.
///
/// # Safety
/// `slot` must point to at least 4 writable bytes, 4-aligned.
#[inline]
unsafe fn link<'a>(slot: NonNull<u8>) -> &'a AtomicU32 {
    // Safety: upheld by caller; slots are at least 16-aligned.
    unsafe { &*slot.as_ptr().cast::<AtomicU32>() }
}

/// Treiber stack of free slots with an ABA-safe tagged head.
///
/// The head tag doubles as a short-held reservation. An even tag is stable.
/// A pop first moves the tag to odd (pinning the head node), reads the
/// node's link, then installs `(next, tag + 2)`, a handful of instructions
/// later. Pushers and poppers that observe an odd tag spin until it settles,
/// so a popper preempted inside that window stalls the list like a spin
/// lock would. A popped node's link is therefore never read after another
/// thread has reused the slot.
pub(crate) struct FreeList {
    head: AtomicTaggedCompact,
    limit: usize,
}

impl FreeList {
    /// An empty list for slots below arena offset `limit`.
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            head: AtomicTaggedCompact::new(TaggedCompact::EMPTY),
            limit,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).ptr() == 0
    }

    /// Push one slot.
    ///
    /// # Safety
    /// `slot` lies inside the arena at `base`, is 16-aligned relative to it,
    /// is not on any list, and nobody else accesses it until it is popped.
    #[inline]
    pub(crate) unsafe fn push(&self, base: NonNull<u8>, slot: NonNull<u8>) {
        // Safety: forwarded.
        unsafe { self.push_chain(base, slot, slot) };
    }

    /// Splice a chain `first ..= last`, already linked through the in-slot
    /// link fields, onto the list with one CAS.
    ///
    /// # Safety
    /// As for [`push`](Self::push), for every slot of the chain.
    pub(crate) unsafe fn push_chain(
        &self,
        base: NonNull<u8>,
        first: NonNull<u8>,
        last: NonNull<u8>,
    ) {
        let new_ptr = encode_slot(base, self.limit, first).raw();
        loop {
            let old = self.head.load(Ordering::Acquire);
            // Odd tag: a pop holds the head node. Wait for it to settle.
            if old.tag() % 2 != 0 {
                hint::spin_loop();
                continue;
            }
            // Safety: `last` is ours until the CAS publishes it.
            unsafe { link(last).store(old.ptr(), Ordering::Relaxed) };
            let new = TaggedCompact::new(new_ptr, old.tag().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop one slot.
    ///
    /// # Safety
    /// `base` is the arena base every slot on this list was pushed against.
    pub(crate) unsafe fn pop(&self, base: NonNull<u8>) -> Option<NonNull<u8>> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            if old.ptr() == 0 {
                return None;
            }
            if old.tag() % 2 != 0 {
                hint::spin_loop();
                continue;
            }
            let node = decode_slot(base, old.ptr())?;

            // Reserve (even -> odd): pins the head node against concurrent
            // pops and pushes so its link can be read.
            let reserved = TaggedCompact::new(old.ptr(), old.tag().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old, reserved, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // Safety: the reservation keeps `node` on the list, so it is a
            // free slot nobody else writes.
            let next = unsafe { link(node).load(Ordering::Relaxed) };

            // Commit (odd -> even).
            let settled = TaggedCompact::new(next, old.tag().wrapping_add(2));
            let res = self
                .head
                .compare_exchange(reserved, settled, Ordering::Release, Ordering::Relaxed);
            debug_assert!(res.is_ok(), "free list reservation broken");
            return Some(node);
        }
    }

    /// Forget every slot on the list.
    ///
    /// Only valid while no other thread can push or pop, i.e. while the
    /// owning view is marked busy with no live objects.
    pub(crate) fn reset(&self) {
        let old = self.head.load(Ordering::Acquire);
        debug_assert!(old.tag() % 2 == 0, "free list reset during a pop");
        self.head.store(
            TaggedCompact::new(0, old.tag().wrapping_add(2)),
            Ordering::Release,
        );
    }
}

/// A detached run of linked free slots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Chain {
    pub first: NonNull<u8>,
    pub last: NonNull<u8>,
    pub count: u32,
}

impl Chain {
    /// Walk the chain. The link of each slot is read before the slot is
    /// yielded, so the caller may reuse a yielded slot immediately.
    pub(crate) fn slots(self, base: NonNull<u8>) -> ChainSlots {
        ChainSlots {
            base,
            next: Some(self.first),
            remaining: self.count,
        }
    }
}

pub(crate) struct ChainSlots {
    base: NonNull<u8>,
    next: Option<NonNull<u8>>,
    remaining: u32,
}

impl Iterator for ChainSlots {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next?;
        self.remaining -= 1;
        // Safety: slots of a detached chain are owned by the walker.
        let raw = unsafe { slot.as_ptr().cast::<u32>().read() };
        self.next = decode_slot(self.base, raw);
        Some(slot)
    }
}

/// Single-owner free list for a thread cache. No atomics.
pub(crate) struct LocalFreeList {
    head: Option<NonNull<u8>>,
    /// `head` encoded, as stored in the link of the next pushed slot.
    head_raw: u32,
    tail: Option<NonNull<u8>>,
    count: u32,
    limit: usize,
}

impl LocalFreeList {
    /// An empty list for slots below arena offset `limit`.
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            head: None,
            head_raw: 0,
            tail: None,
            count: 0,
            limit,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.count
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// # Safety
    /// `ptr` is a free slot inside the arena at `base`, owned by the caller.
    #[inline]
    pub(crate) unsafe fn push(&mut self, base: NonNull<u8>, ptr: NonNull<u8>) {
        let raw = encode_slot(base, self.limit, ptr).raw();
        // Safety: upheld by caller; slots are at least 16 bytes and 16-aligned.
        unsafe { ptr.as_ptr().cast::<u32>().write(self.head_raw) };
        self.head = Some(ptr);
        self.head_raw = raw;
        if self.tail.is_none() {
            self.tail = Some(ptr);
        }
        self.count += 1;
    }

    /// # Safety
    /// Every slot on the list was pushed against the same `base`.
    #[inline]
    pub(crate) unsafe fn pop(&mut self, base: NonNull<u8>) -> Option<NonNull<u8>> {
        let ptr = self.head?;
        // Safety: see push.
        let next = unsafe { ptr.as_ptr().cast::<u32>().read() };
        self.head = decode_slot(base, next);
        self.head_raw = next;
        self.count -= 1;
        if self.count == 0 {
            self.head = None;
            self.head_raw = 0;
            self.tail = None;
        }
        Some(ptr)
    }

    /// Detach the whole list.
    pub(crate) fn take(&mut self) -> Option<Chain> {
        let first = self.head.take()?;
        let last = self.tail.take()?;
        self.head_raw = 0;
        let count = std::mem::replace(&mut self.count, 0);
        Some(Chain { first, last, count })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use std::collections::HashSet;

    /// 16-byte aligned scratch buffer standing in for an arena.
    struct Scratch {
        slots: *mut [u128],
    }

    // Safety: Test code. Slots are handed between threads through the lists.
    unsafe impl Send for Scratch {}
    // Safety: Test code.
    unsafe impl Sync for Scratch {}

    impl Scratch {
        fn new(n: usize) -> Self {
            Self {
                slots: Box::into_raw(vec![0u128; n].into_boxed_slice()),
            }
        }

        fn base(&self) -> NonNull<u8> {
            NonNull::new(self.slots.cast::<u8>()).unwrap()
        }

        fn len(&self) -> usize {
            self.slots.len() * 16
        }

        fn slot(&self, i: usize) -> NonNull<u8> {
            assert!(i < self.slots.len());
            NonNull::new(self.slots.cast::<u128>().wrapping_add(i).cast::<u8>()).unwrap()
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            // Safety: Test code. Allocated by `new`.
            drop(unsafe { Box::from_raw(self.slots) });
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let scratch = Scratch::new(8);
        let base = scratch.base();
        let list = FreeList::new(scratch.len());
        assert!(list.is_empty());
        // Safety: Test code.
        unsafe {
            for i in 0..4 {
                list.push(base, scratch.slot(i));
            }
            for i in (0..4).rev() {
                assert_eq!(list.pop(base), Some(scratch.slot(i)));
            }
            assert_eq!(list.pop(base), None);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn test_slot_zero_is_not_null() {
        // Offset 0 encodes to raw 1, so the first slot of the arena is a
        // valid list entry.
        let scratch = Scratch::new(2);
        let base = scratch.base();
        let list = FreeList::new(scratch.len());
        // Safety: Test code.
        unsafe {
            list.push(base, scratch.slot(0));
            assert!(!list.is_empty());
            assert_eq!(list.pop(base), Some(scratch.slot(0)));
        }
    }

    #[test]
    fn test_local_chain_splices_onto_shared_list() {
        let scratch = Scratch::new(16);
        let base = scratch.base();
        let shared = FreeList::new(scratch.len());
        let mut local = LocalFreeList::new(scratch.len());
        // Safety: Test code.
        unsafe {
            shared.push(base, scratch.slot(15));
            for i in 0..5 {
                local.push(base, scratch.slot(i));
            }
            assert_eq!(local.len(), 5);
            let chain = local.take().unwrap();
            assert!(local.is_empty());
            assert_eq!(chain.count, 5);
            assert_eq!(chain.first, scratch.slot(4));
            assert_eq!(chain.last, scratch.slot(0));
            shared.push_chain(base, chain.first, chain.last);

            let popped: Vec<_> = std::iter::from_fn(|| shared.pop(base)).collect();
            let expected: Vec<_> = [4, 3, 2, 1, 0, 15].iter().map(|&i| scratch.slot(i)).collect();
            assert_eq!(popped, expected);
        }
    }

    #[test]
    fn test_chain_walk() {
        let scratch = Scratch::new(8);
        let base = scratch.base();
        let mut local = LocalFreeList::new(scratch.len());
        // Safety: Test code.
        unsafe {
            for i in [1, 3, 5] {
                local.push(base, scratch.slot(i));
            }
        }
        let walked: Vec<_> = local.take().unwrap().slots(base).collect();
        let expected: Vec<_> = [5, 3, 1].iter().map(|&i| scratch.slot(i)).collect();
        assert_eq!(walked, expected);
    }

    #[test]
    fn test_local_pop_until_empty_resets_tail() {
        let scratch = Scratch::new(4);
        let base = scratch.base();
        let mut local = LocalFreeList::new(scratch.len());
        // Safety: Test code.
        unsafe {
            local.push(base, scratch.slot(0));
            assert_eq!(local.pop(base), Some(scratch.slot(0)));
            assert_eq!(local.pop(base), None);
            local.push(base, scratch.slot(1));
        }
        let chain = local.take().unwrap();
        assert_eq!(chain.first, chain.last);
        assert_eq!(chain.count, 1);
    }

    #[test]
    fn test_reset_forgets_slots() {
        let scratch = Scratch::new(4);
        let base = scratch.base();
        let list = FreeList::new(scratch.len());
        // Safety: Test code.
        unsafe {
            list.push(base, scratch.slot(2));
            list.reset();
            assert_eq!(list.pop(base), None);
        }
    }

    #[test]
    fn test_concurrent_push_pop_no_duplicates() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 256;
        const ROUNDS: usize = 200;

        let scratch = Arc::new(Scratch::new(THREADS * PER_THREAD));
        let list = Arc::new(FreeList::new(scratch.len()));
        let base_addr = scratch.base().as_ptr() as usize;

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let scratch = Arc::clone(&scratch);
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let base = NonNull::new(base_addr as *mut u8).unwrap();
                    let mut mine: Vec<usize> = (0..PER_THREAD)
                        .map(|i| scratch.slot(t * PER_THREAD + i).as_ptr() as usize)
                        .collect();
                    for _ in 0..ROUNDS {
                        // Safety: Test code. Each slot is on at most one list.
                        unsafe {
                            for &p in &mine {
                                list.push(base, NonNull::new(p as *mut u8).unwrap());
                            }
                            mine.clear();
                            while mine.len() < PER_THREAD {
                                match list.pop(base) {
                                    Some(p) => mine.push(p.as_ptr() as usize),
                                    None => break,
                                }
                            }
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for p in h.join().unwrap() {
                assert!(seen.insert(p), "slot {p:#x} handed out twice");
            }
        }
        // Safety: Test code.
        while let Some(p) = unsafe { list.pop(scratch.base()) } {
            assert!(seen.insert(p.as_ptr() as usize), "slot {p:p} on list and held");
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn test_slot_past_limit_is_rejected() {
        let scratch = Scratch::new(8);
        let base = scratch.base();
        // Only the first four slots belong to the list's range.
        let list = FreeList::new(4 * 16);
        // Safety: Test code. Deliberately out of range.
        unsafe { list.push(base, scratch.slot(5)) };
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn test_local_slot_past_limit_is_rejected() {
        let scratch = Scratch::new(8);
        let base = scratch.base();
        let mut local = LocalFreeList::new(4 * 16);
        // Safety: Test code.
        unsafe {
            local.push(base, scratch.slot(3));
            local.push(base, scratch.slot(4));
        }
    }
}
