//! Size-class directory: per class, the pages whose views are EMPTY, PARTIAL
//! or FULL.
//!
//! Exclusive classes each own a set triple. All bitfit classes share one,
//! since a bitfit page serves every bitfit class. The bitmaps are a hint
//! maintained by whichever thread changed a view's state; the status word
//! stays the source of truth.
//!
//! A page serves the class it was first claimed for until the arena runs out
//! of fresh pages. From then on a class with nothing left to claim takes an
//! EMPTY page from another class's sets and rebinds it.

use std::ptr::NonNull;

use crate::memory::arena::Arena;
use crate::memory::bitfit::{BitfitClaim, BitfitView};
use crate::memory::bitmap::AtomicBitmap;
use crate::memory::error::AllocError;
use crate::memory::exclusive::{ExclusiveView, Reservation};
use crate::memory::size_class::{SizeClass, SizeClassTable, ViewKind};
use crate::memory::stats::ViewCensus;
use crate::memory::view::{PageTable, Transition, View, ViewState};
use crate::sync::thread;

pub(crate) struct ViewSets {
    pub(crate) empty: AtomicBitmap,
    pub(crate) partial: AtomicBitmap,
    pub(crate) full: AtomicBitmap,
}

impl ViewSets {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            empty: AtomicBitmap::new(pages),
            partial: AtomicBitmap::new(pages),
            full: AtomicBitmap::new(pages),
        }
    }

    /// Move `page` into the set for `state`. Set first, then clear the
    /// others, so a scanner never misses a page that has a live state.
    fn apply(&self, page: usize, state: ViewState) {
        let (target, others) = match state {
            ViewState::Empty => (&self.empty, [&self.partial, &self.full]),
            ViewState::Partial => (&self.partial, [&self.empty, &self.full]),
            ViewState::Full => (&self.full, [&self.empty, &self.partial]),
        };
        target.set(page);
        for other in others {
            other.clear(page);
        }
    }

    /// Drop `page` from all three sets.
    fn forget(&self, page: usize) {
        for set in [&self.empty, &self.partial, &self.full] {
            set.clear(page);
        }
    }

    /// Record `state` for `page`, then re-read the view and repeat until the
    /// recorded state matches the view's current one.
    pub(crate) fn publish_state(&self, page: usize, view: &View, mut state: ViewState) {
        loop {
            self.apply(page, state);
            let now = view.status().state();
            if now == state {
                return;
            }
            state = now;
        }
    }

    /// Publish a status transition, if it moved the view between states.
    #[inline]
    pub(crate) fn publish(&self, page: usize, view: &View, transition: Transition) {
        if transition.changed_state() {
            self.publish_state(page, view, transition.after.state());
        }
    }

    /// Which set `page` is recorded in, if exactly one.
    #[cfg(test)]
    pub(crate) fn recorded_state(&self, page: usize) -> Option<ViewState> {
        match (
            self.empty.contains(page),
            self.partial.contains(page),
            self.full.contains(page),
        ) {
            (true, false, false) => Some(ViewState::Empty),
            (false, true, false) => Some(ViewState::Partial),
            (false, false, true) => Some(ViewState::Full),
            _ => None,
        }
    }
}

/// Slots handed out by one [`Directory::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claimed {
    pub page: usize,
    pub count: u32,
}

pub(crate) struct Directory {
    bitfit: ViewSets,
    /// Indexed by `class.index - first_exclusive`.
    exclusive: Vec<ViewSets>,
    first_exclusive: usize,
}

impl Directory {
    pub(crate) fn new(classes: &SizeClassTable, pages: usize) -> Self {
        let first_exclusive = classes
            .classes()
            .iter()
            .position(|c| c.kind == ViewKind::Exclusive)
            .unwrap_or(classes.len());
        Self {
            bitfit: ViewSets::new(pages),
            exclusive: (first_exclusive..classes.len())
                .map(|_| ViewSets::new(pages))
                .collect(),
            first_exclusive,
        }
    }

    #[inline]
    pub(crate) fn sets_for_class(&self, class: &SizeClass) -> &ViewSets {
        match class.kind {
            ViewKind::Bitfit => &self.bitfit,
            ViewKind::Exclusive => &self.exclusive[class.index - self.first_exclusive],
        }
    }

    #[inline]
    pub(crate) fn sets_for_view(&self, view: &View) -> &ViewSets {
        match view {
            View::Bitfit(_) => &self.bitfit,
            View::Exclusive(v) => &self.exclusive[v.class() - self.first_exclusive],
        }
    }

    /// Every set triple, bitfit first.
    pub(crate) fn all_sets(&self) -> impl Iterator<Item = &ViewSets> {
        std::iter::once(&self.bitfit).chain(self.exclusive.iter())
    }

    /// Claim up to `want` objects of `class`, handing each to `sink`.
    ///
    /// Scans PARTIAL views, then EMPTY ones (recommitting a decommitted page
    /// on the way), then grows the class by one fresh page. Once the arena
    /// has none left, an idle page of another class is rebound instead.
    pub(crate) fn claim(
        &self,
        arena: &Arena,
        pages: &PageTable,
        class: &SizeClass,
        want: u32,
        mut sink: impl FnMut(NonNull<u8>),
    ) -> Result<Claimed, AllocError> {
        debug_assert!(want > 0);
        let sets = self.sets_for_class(class);
        loop {
            let limit = arena.pages_in_use();
            let mut saw_busy = false;
            let candidates = sets.partial.iter_ones(limit).chain(sets.empty.iter_ones(limit));
            for page in candidates {
                let Some(view) = pages.get(page) else {
                    continue;
                };
                match self.try_view(arena, sets, page, view, class, want, &mut sink)? {
                    Attempt::Claimed(count) => return Ok(Claimed { page, count }),
                    Attempt::Busy => saw_busy = true,
                    Attempt::Skip => {}
                }
            }

            if let Some(page) = arena.claim_page() {
                self.grow(arena, pages, sets, page, class)?;
            } else if self.steal(arena, pages, class)? {
                continue;
            } else if saw_busy {
                // A busy view may come back committed and empty.
                thread::yield_now();
            } else {
                return Err(AllocError::OutOfMemory { size: class.size });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_view(
        &self,
        arena: &Arena,
        sets: &ViewSets,
        page: usize,
        view: &View,
        class: &SizeClass,
        want: u32,
        sink: &mut impl FnMut(NonNull<u8>),
    ) -> Result<Attempt, AllocError> {
        let base = arena.base();
        loop {
            let attempt = match view {
                View::Exclusive(v) => Self::try_exclusive(base, sets, view, v, class, want, sink),
                View::Bitfit(v) if class.kind == ViewKind::Bitfit => {
                    Self::try_bitfit(base, sets, view, v, class, want, sink)
                }
                // Stale entry for a page that has since changed kind.
                View::Bitfit(_) => return Ok(Attempt::Skip),
            };
            match attempt {
                Some(result) => return Ok(result),
                None if Self::recommit(arena, page, view)? => {}
                None => return Ok(Attempt::Busy),
            }
        }
    }

    /// `None` means the view is decommitted.
    fn try_exclusive(
        base: NonNull<u8>,
        sets: &ViewSets,
        view: &View,
        v: &ExclusiveView,
        class: &SizeClass,
        want: u32,
        sink: &mut impl FnMut(NonNull<u8>),
    ) -> Option<Attempt> {
        match v.reserve(class.index, want) {
            Reservation::Claimed { count, transition } => {
                for _ in 0..count {
                    // Safety: `count` slots are reserved on this view.
                    sink(unsafe { v.take_slot(base) });
                }
                sets.publish(v.page(), view, transition);
                Some(Attempt::Claimed(count))
            }
            Reservation::Full | Reservation::OtherClass => Some(Attempt::Skip),
            Reservation::Busy => Some(Attempt::Busy),
            Reservation::Decommitted => None,
        }
    }

    fn try_bitfit(
        base: NonNull<u8>,
        sets: &ViewSets,
        view: &View,
        v: &BitfitView,
        class: &SizeClass,
        want: u32,
        sink: &mut impl FnMut(NonNull<u8>),
    ) -> Option<Attempt> {
        match v.allocate(base, class.size, class.alignment, want, &mut *sink) {
            BitfitClaim::Claimed { count, transition } => {
                sets.publish(v.page(), view, transition);
                Some(Attempt::Claimed(count))
            }
            BitfitClaim::NoFit => Some(Attempt::Skip),
            BitfitClaim::Busy => Some(Attempt::Busy),
            BitfitClaim::Decommitted => None,
        }
    }

    /// Bring a decommitted view back. `Ok(false)` if another thread is
    /// already committing or decommitting it.
    fn recommit(arena: &Arena, page: usize, view: &View) -> Result<bool, AllocError> {
        if !view.try_begin_recommit() {
            return Ok(false);
        }
        // Empty and busy: the state is unchanged, so nothing to publish.
        match arena.commit_page(page) {
            Ok(()) => {
                view.end_busy(true);
                Ok(true)
            }
            Err(e) => {
                view.end_busy(false);
                Err(AllocError::Commit(e))
            }
        }
    }

    /// Create, commit and publish the view for a freshly claimed page.
    fn grow(
        &self,
        arena: &Arena,
        pages: &PageTable,
        sets: &ViewSets,
        page: usize,
        class: &SizeClass,
    ) -> Result<(), AllocError> {
        let view = View::new(page, class);
        // Not yet visible to anyone: marking busy cannot fail.
        let began = view.try_begin_recommit();
        debug_assert!(began);
        let view = pages.install(page, view);
        arena.stats().views_created.incr();
        log::trace!("segheap: page {page} now serves {class}");

        let committed = arena.commit_page(page);
        view.end_busy(committed.is_ok());
        // Published even when the commit failed, so a later claim retries it.
        sets.publish_state(page, view, ViewState::Empty);
        committed.map_err(AllocError::Commit)
    }

    /// Rebind an EMPTY page of another class to `class` and publish it in
    /// `class`'s sets. `Ok(false)` if no page could be taken.
    fn steal(
        &self,
        arena: &Arena,
        pages: &PageTable,
        class: &SizeClass,
    ) -> Result<bool, AllocError> {
        let limit = arena.pages_in_use();
        let target = self.sets_for_class(class);
        for sets in self.all_sets().filter(|sets| !std::ptr::eq(*sets, target)) {
            for page in sets.empty.iter_ones(limit) {
                let Some(view) = pages.get(page) else {
                    continue;
                };
                let committed = if view.try_begin_recommit() {
                    false
                } else if view.try_begin_decommit() {
                    view.reset_slots();
                    true
                } else {
                    continue;
                };
                if !std::ptr::eq(self.sets_for_view(view), sets) {
                    // Stale entry: the page already moved.
                    view.end_busy(committed);
                    continue;
                }

                sets.forget(page);
                let (view, created) = pages.rebind(page, class, committed);
                if created {
                    arena.stats().views_created.incr();
                }
                log::debug!("segheap: idle page {page} rebound to {class}");
                let result = if committed { Ok(()) } else { arena.commit_page(page) };
                view.end_busy(result.is_ok());
                // Published even when the commit failed, as in `grow`.
                target.publish_state(page, view, ViewState::Empty);
                result.map_err(AllocError::Commit)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Return one object to its view.
    ///
    /// # Safety
    /// `ptr` is a live object of `view`, which serves page `page`.
    pub(crate) unsafe fn free(
        &self,
        base: NonNull<u8>,
        page: usize,
        view: &View,
        ptr: NonNull<u8>,
    ) {
        let transition = match view {
            // Safety: forwarded from the caller.
            View::Exclusive(v) => unsafe { v.free(base, ptr) },
            View::Bitfit(v) => v.free(base, ptr),
        };
        self.sets_for_view(view).publish(page, view, transition);
    }

    /// Census of every view reachable from the page table.
    pub(crate) fn census(&self, arena: &Arena, pages: &PageTable) -> ViewCensus {
        let mut census = ViewCensus::default();
        for page in 0..arena.pages_in_use() {
            let Some(view) = pages.get(page) else {
                continue;
            };
            let status = view.status();
            if !status.is_committed() {
                census.decommitted += 1;
                continue;
            }
            match status.state() {
                ViewState::Empty => census.empty += 1,
                ViewState::Partial => census.partial += 1,
                ViewState::Full => census.full += 1,
            }
        }
        census
    }

    /// Panics unless every installed view is recorded in exactly the set of
    /// its current state. Only meaningful while no thread is mutating.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self, arena: &Arena, pages: &PageTable) {
        for page in 0..arena.pages_in_use() {
            let Some(view) = pages.get(page) else {
                continue;
            };
            let sets = self.sets_for_view(view);
            assert_eq!(
                sets.recorded_state(page),
                Some(view.status().state()),
                "page {page} is recorded in the wrong set ({:?})",
                view.status()
            );
            for other in self.all_sets() {
                if !std::ptr::eq(other, sets) {
                    assert_eq!(
                        other.recorded_state(page),
                        None,
                        "page {page} listed by another class"
                    );
                }
            }
        }
    }
}

enum Attempt {
    Claimed(u32),
    /// Full or no fitting run: try the next view.
    Skip,
    /// Mid-decommit or recommit by another thread.
    Busy,
}
