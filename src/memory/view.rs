//! Per-page view metadata shared by both view kinds: the packed status word
//! and the page table that maps a page index to its view.
//!
//! View metadata lives off-page, in the heap's own allocations, so a page can
//! be decommitted without losing its view.

use std::fmt;

use crate::memory::bitfit::BitfitView;
use crate::memory::exclusive::ExclusiveView;
use crate::memory::size_class::{SizeClass, ViewKind};
use crate::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Occupancy state derived from a view's live count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Empty,
    Partial,
    Full,
}

impl ViewState {
    #[inline]
    pub fn derive(live: u32, capacity: u32) -> Self {
        if live == 0 {
            ViewState::Empty
        } else if live >= capacity {
            ViewState::Full
        } else {
            ViewState::Partial
        }
    }

    const fn to_bits(self) -> u64 {
        match self {
            ViewState::Empty => 0,
            ViewState::Partial => 1,
            ViewState::Full => 2,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits {
            0 => ViewState::Empty,
            1 => ViewState::Partial,
            _ => ViewState::Full,
        }
    }
}

// Status word layout:
//   bits [31:0]   live count
//   bits [33:32]  state
//   bit  34       committed
//   bit  35       busy (decommit or recommit in flight)
//   bits [63:36]  version, bumped by every transition
const LIVE_MASK: u64 = 0xFFFF_FFFF;
const STATE_SHIFT: u32 = 32;
const STATE_MASK: u64 = 0b11 << STATE_SHIFT;
const COMMITTED_BIT: u64 = 1 << 34;
const BUSY_BIT: u64 = 1 << 35;
const VERSION_SHIFT: u32 = 36;
const VERSION_ONE: u64 = 1 << VERSION_SHIFT;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ViewStatus(u64);

impl ViewStatus {
    /// A fresh view: empty, not yet committed.
    pub(crate) const INITIAL: Self = Self(0);

    #[inline]
    pub(crate) const fn live(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 & LIVE_MASK) as u32
        }
    }

    #[inline]
    pub(crate) const fn state(self) -> ViewState {
        ViewState::from_bits((self.0 & STATE_MASK) >> STATE_SHIFT)
    }

    #[inline]
    pub(crate) const fn is_committed(self) -> bool {
        self.0 & COMMITTED_BIT != 0
    }

    #[inline]
    pub(crate) const fn is_busy(self) -> bool {
        self.0 & BUSY_BIT != 0
    }

    #[inline]
    pub(crate) const fn version(self) -> u32 {
        (self.0 >> VERSION_SHIFT) as u32
    }

    #[inline]
    const fn bumped(self) -> Self {
        Self(self.0.wrapping_add(VERSION_ONE))
    }

    /// New live count with its derived state.
    #[inline]
    pub(crate) fn with_live(self, live: u32, capacity: u32) -> Self {
        let state = ViewState::derive(live, capacity);
        let rest = self.0 & !(LIVE_MASK | STATE_MASK);
        Self(rest | u64::from(live) | (state.to_bits() << STATE_SHIFT)).bumped()
    }

    #[inline]
    pub(crate) fn with_committed(self, committed: bool) -> Self {
        let bits = if committed { self.0 | COMMITTED_BIT } else { self.0 & !COMMITTED_BIT };
        Self(bits).bumped()
    }

    #[inline]
    pub(crate) fn with_busy(self, busy: bool) -> Self {
        let bits = if busy { self.0 | BUSY_BIT } else { self.0 & !BUSY_BIT };
        Self(bits).bumped()
    }
}

impl fmt::Debug for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewStatus")
            .field("live", &self.live())
            .field("state", &self.state())
            .field("committed", &self.is_committed())
            .field("busy", &self.is_busy())
            .field("version", &self.version())
            .finish()
    }
}

/// Atomic cell holding a [`ViewStatus`].
pub(crate) struct StatusWord(AtomicU64);

impl StatusWord {
    pub(crate) fn new(status: ViewStatus) -> Self {
        Self(AtomicU64::new(status.0))
    }

    #[inline]
    pub(crate) fn load(&self) -> ViewStatus {
        ViewStatus(self.0.load(Ordering::Acquire))
    }

    /// CAS loop applying `f` until it succeeds or `f` declines. Returns
    /// `(before, after)` on success and the refusing status otherwise.
    #[inline]
    pub(crate) fn update(
        &self,
        mut f: impl FnMut(ViewStatus) -> Option<ViewStatus>,
    ) -> Result<(ViewStatus, ViewStatus), ViewStatus> {
        let mut current = self.load();
        loop {
            let next = f(current).ok_or(current)?;
            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((current, next)),
                Err(actual) => current = ViewStatus(actual),
            }
        }
    }

    /// Unconditional CAS loop.
    #[inline]
    pub(crate) fn modify(&self, mut f: impl FnMut(ViewStatus) -> ViewStatus) -> Transition {
        let mut current = self.load();
        loop {
            let next = f(current);
            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Transition { before: current, after: next },
                Err(actual) => current = ViewStatus(actual),
            }
        }
    }
}

/// A state change made by one status CAS, to be published to the directory
/// when the state differs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition {
    pub before: ViewStatus,
    pub after: ViewStatus,
}

impl Transition {
    #[inline]
    pub(crate) fn changed_state(&self) -> bool {
        self.before.state() != self.after.state()
    }
}

impl From<(ViewStatus, ViewStatus)> for Transition {
    fn from((before, after): (ViewStatus, ViewStatus)) -> Self {
        Self { before, after }
    }
}

pub(crate) enum View {
    Exclusive(ExclusiveView),
    Bitfit(BitfitView),
}

impl View {
    /// A fresh, uncommitted view of `page` for `class`.
    pub(crate) fn new(page: usize, class: &SizeClass) -> Self {
        match class.kind {
            ViewKind::Exclusive => View::Exclusive(ExclusiveView::new(page, class)),
            ViewKind::Bitfit => View::Bitfit(BitfitView::new(page)),
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> ViewKind {
        match self {
            View::Exclusive(_) => ViewKind::Exclusive,
            View::Bitfit(_) => ViewKind::Bitfit,
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> ViewStatus {
        match self {
            View::Exclusive(v) => v.status(),
            View::Bitfit(v) => v.status(),
        }
    }

    pub(crate) fn try_begin_decommit(&self) -> bool {
        match self {
            View::Exclusive(v) => v.try_begin_decommit(),
            View::Bitfit(v) => v.try_begin_decommit(),
        }
    }

    pub(crate) fn try_begin_recommit(&self) -> bool {
        match self {
            View::Exclusive(v) => v.try_begin_recommit(),
            View::Bitfit(v) => v.try_begin_recommit(),
        }
    }

    /// Forget free-slot bookkeeping before the page is decommitted. Bitfit
    /// bitmaps are already clear on an empty view.
    pub(crate) fn reset_slots(&self) {
        if let View::Exclusive(v) = self {
            v.reset_slots();
        }
    }

    pub(crate) fn end_busy(&self, committed: bool) -> Transition {
        match self {
            View::Exclusive(v) => v.end_busy(committed),
            View::Bitfit(v) => v.end_busy(committed),
        }
    }

    fn adopt(&self, committed: bool) {
        match self {
            View::Exclusive(v) => v.adopt(committed),
            View::Bitfit(v) => v.adopt(committed),
        }
    }
}

/// Page index -> view.
///
/// A page gets its first view from the thread that claimed it from the
/// arena. When an idle page moves to a class of the other kind, its current
/// view is parked, still busy, and the parked view of that kind (or a new
/// one) takes its place. A page therefore owns at most one view per kind,
/// and a view reference stays valid until the table is dropped.
pub(crate) struct PageTable {
    slots: Box<[AtomicPtr<View>]>,
    parked: Box<[AtomicPtr<View>]>,
}

fn null_slots(pages: usize) -> Box<[AtomicPtr<View>]> {
    (0..pages)
        .map(|_| AtomicPtr::new(std::ptr::null_mut()))
        .collect()
}

impl PageTable {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            slots: null_slots(pages),
            parked: null_slots(pages),
        }
    }

    #[inline]
    pub(crate) fn get(&self, page: usize) -> Option<&View> {
        let ptr = self.slots.get(page)?.load(Ordering::Acquire);
        // Safety: non-null slots hold a leaked Box<View> that lives until
        // the table is dropped.
        unsafe { ptr.as_ref() }
    }

    /// Publish the view for a freshly claimed page.
    pub(crate) fn install(&self, page: usize, view: View) -> &View {
        let ptr = Box::into_raw(Box::new(view));
        let prev = self.slots[page].swap(ptr, Ordering::AcqRel);
        assert!(prev.is_null(), "page {page} already has a view");
        // Safety: just leaked above; freed only by Drop.
        unsafe { &*ptr }
    }

    /// Point `page` at a view serving `class`.
    ///
    /// The caller holds the busy mark of the page's current view, which has
    /// no live objects. The returned view is still busy and records
    /// `committed`; the flag is `true` if it had to be created.
    ///
    /// # Panics
    /// If `page` has no view.
    pub(crate) fn rebind(&self, page: usize, class: &SizeClass, committed: bool) -> (&View, bool) {
        let Some(current) = self.get(page) else {
            panic!("page {page} has no view to rebind");
        };
        debug_assert!(current.status().is_busy());
        if current.kind() == class.kind {
            if let View::Exclusive(v) = current {
                v.bind(class);
            }
            return (current, false);
        }

        let parked = self.parked[page].swap(std::ptr::null_mut(), Ordering::AcqRel);
        let created = parked.is_null();
        let next = if created {
            let view = View::new(page, class);
            let began = view.try_begin_recommit();
            debug_assert!(began);
            Box::into_raw(Box::new(view))
        } else {
            parked
        };
        // Safety: leaked above or by an earlier rebind; freed only by Drop.
        let view = unsafe { &*next };
        if let View::Exclusive(v) = view {
            v.bind(class);
        }
        view.adopt(committed);
        let prev = self.slots[page].swap(next, Ordering::AcqRel);
        self.parked[page].store(prev, Ordering::Release);
        (view, created)
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for slot in self.slots.iter().chain(self.parked.iter()) {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // Safety: allocated by `install`.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}
