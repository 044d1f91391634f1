//! Bitfit views: several small size classes share one page.
//!
//! The page is split into 16-byte granules. An object is a run of occupied
//! granules whose last granule carries an end bit, so a free needs only the
//! start address. All mutation happens under the per-view mutex; the status
//! word mirrors the occupancy for lock-free readers (directory, census,
//! scavenger).

use std::fmt;
use std::ptr::NonNull;
use std::sync::{PoisonError, TryLockError};

use fixedbitset::FixedBitSet;

use crate::memory::arena::PAGE_SIZE;
use crate::memory::compact::MIN_ALIGN;
use crate::memory::view::{StatusWord, Transition, ViewStatus};
use crate::sync::{Mutex, MutexGuard};

pub(crate) const GRANULE: usize = MIN_ALIGN;
pub(crate) const GRANULES_PER_PAGE: usize = PAGE_SIZE / GRANULE;

#[allow(clippy::cast_possible_truncation)]
const CAPACITY: u32 = GRANULES_PER_PAGE as u32;

/// Outcome of [`BitfitView::allocate`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum BitfitClaim {
    Claimed { count: u32, transition: Transition },
    /// No free run of the requested shape.
    NoFit,
    Busy,
    Decommitted,
}

struct Granules {
    occupied: FixedBitSet,
    ends: FixedBitSet,
}

impl Granules {
    /// First free run of `len` granules starting at a multiple of `align`,
    /// at or after `from`.
    fn find_run(&self, from: usize, len: usize, align: usize) -> Option<usize> {
        let mut start = from.next_multiple_of(align);
        while start + len <= GRANULES_PER_PAGE {
            match (start..start + len).rev().find(|&g| self.occupied.contains(g)) {
                None => return Some(start),
                Some(taken) => start = (taken + 1).next_multiple_of(align),
            }
        }
        None
    }

    fn is_object_start(&self, granule: usize) -> bool {
        self.occupied.contains(granule)
            && (granule == 0
                || !self.occupied.contains(granule - 1)
                || self.ends.contains(granule - 1))
    }

    fn run_end(&self, start: usize) -> usize {
        (start..GRANULES_PER_PAGE)
            .find(|&g| self.ends.contains(g))
            .unwrap_or_else(|| panic!("granule run at {start} has no end bit"))
    }
}

pub(crate) struct BitfitView {
    page: usize,
    status: StatusWord,
    granules: Mutex<Granules>,
}

impl BitfitView {
    pub(crate) fn new(page: usize) -> Self {
        Self {
            page,
            status: StatusWord::new(ViewStatus::INITIAL),
            granules: Mutex::new(Granules {
                occupied: FixedBitSet::with_capacity(GRANULES_PER_PAGE),
                ends: FixedBitSet::with_capacity(GRANULES_PER_PAGE),
            }),
        }
    }

    #[inline]
    pub(crate) fn page(&self) -> usize {
        self.page
    }

    #[inline]
    pub(crate) fn status(&self) -> ViewStatus {
        self.status.load()
    }

    fn lock(&self) -> MutexGuard<'_, Granules> {
        self.granules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn page_base(&self, base: NonNull<u8>) -> NonNull<u8> {
        // Safety: `page` was handed out by the arena at `base`.
        unsafe { base.add(self.page * PAGE_SIZE) }
    }

    #[inline]
    fn granule_of(&self, base: NonNull<u8>, ptr: NonNull<u8>) -> usize {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.page_base(base).as_ptr() as usize);
        assert!(offset < PAGE_SIZE, "{ptr:p} is outside bitfit page {}", self.page);
        debug_assert!(offset.is_multiple_of(GRANULE), "{ptr:p} is not granule aligned");
        offset / GRANULE
    }

    /// First-fit up to `want` objects of `size` bytes aligned to `align`,
    /// handing each to `sink`.
    pub(crate) fn allocate(
        &self,
        base: NonNull<u8>,
        size: usize,
        align: usize,
        want: u32,
        mut sink: impl FnMut(NonNull<u8>),
    ) -> BitfitClaim {
        let len = size.div_ceil(GRANULE);
        let align = (align / GRANULE).max(1);
        let page_base = self.page_base(base);

        let mut granules = self.lock();
        let status = self.status.load();
        if status.is_busy() {
            return BitfitClaim::Busy;
        }
        if !status.is_committed() {
            return BitfitClaim::Decommitted;
        }

        let mut count = 0;
        let mut from = 0;
        while count < want {
            let Some(start) = granules.find_run(from, len, align) else {
                break;
            };
            granules.occupied.set_range(start..start + len, true);
            granules.ends.insert(start + len - 1);
            // Safety: the run lies inside the page.
            sink(unsafe { page_base.add(start * GRANULE) });
            count += 1;
            from = start + len;
        }
        if count == 0 {
            return BitfitClaim::NoFit;
        }

        #[allow(clippy::cast_possible_truncation)]
        let claimed = count * len as u32;
        let transition = self
            .status
            .modify(|s| s.with_live(s.live() + claimed, CAPACITY));
        drop(granules);
        BitfitClaim::Claimed { count, transition }
    }

    /// Free the object starting at `ptr`.
    ///
    /// # Panics
    /// If `ptr` is not the start of a live object on this page.
    pub(crate) fn free(&self, base: NonNull<u8>, ptr: NonNull<u8>) -> Transition {
        let start = self.granule_of(base, ptr);
        let mut granules = self.lock();
        assert!(
            granules.is_object_start(start),
            "double free or interior pointer {ptr:p} (bitfit page {})",
            self.page
        );
        let end = granules.run_end(start);
        granules.occupied.set_range(start..end + 1, false);
        granules.ends.set(end, false);

        #[allow(clippy::cast_possible_truncation)]
        let released = (end + 1 - start) as u32;
        let transition = self.status.modify(|s| {
            assert!(s.live() >= released, "bitfit occupancy underflow on page {}", self.page);
            s.with_live(s.live() - released, CAPACITY)
        });
        drop(granules);
        transition
    }

    /// Bytes spanned by the live object starting at `ptr`.
    pub(crate) fn usable_size(&self, base: NonNull<u8>, ptr: NonNull<u8>) -> usize {
        let start = self.granule_of(base, ptr);
        let granules = self.lock();
        assert!(
            granules.is_object_start(start),
            "{ptr:p} is not a live object (bitfit page {})",
            self.page
        );
        (granules.run_end(start) + 1 - start) * GRANULE
    }

    /// Mark an empty, committed, idle view busy for decommit. Never blocks:
    /// gives up if the view lock is held.
    pub(crate) fn try_begin_decommit(&self) -> bool {
        let granules = match self.granules.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        let began = self
            .status
            .update(|s| {
                (s.live() == 0 && s.is_committed() && !s.is_busy()).then(|| s.with_busy(true))
            })
            .is_ok();
        debug_assert!(!began || granules.occupied.count_ones(..) == 0);
        began
    }

    /// Mark a decommitted, idle view busy for recommit.
    pub(crate) fn try_begin_recommit(&self) -> bool {
        let _granules = self.lock();
        self.status
            .update(|s| (!s.is_committed() && !s.is_busy()).then(|| s.with_busy(true)))
            .is_ok()
    }

    /// Record whether the page under a busy view is committed, for a view
    /// taking over a page from an exclusive view.
    pub(crate) fn adopt(&self, committed: bool) {
        let _granules = self.lock();
        self.status.modify(|s| {
            debug_assert!(s.is_busy() && s.live() == 0);
            s.with_committed(committed)
        });
    }

    /// Clear the busy mark, recording whether the page is now committed.
    pub(crate) fn end_busy(&self, committed: bool) -> Transition {
        let _granules = self.lock();
        self.status.modify(|s| {
            debug_assert!(s.is_busy());
            s.with_busy(false).with_committed(committed)
        })
    }
}

impl fmt::Debug for BitfitView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitfitView")
            .field("page", &self.page)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
