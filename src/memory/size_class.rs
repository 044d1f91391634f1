//! Size-class table: maps a request to the canonical class that serves it.
//!
//! Classes step by 16 bytes up to 128, then grow geometrically by 1.25,
//! rounded up to the 16-byte granule, until the configured maximum. The
//! table is immutable after construction.

use std::fmt;

use crate::memory::arena::PAGE_SIZE;
use crate::memory::compact::MIN_ALIGN;

/// Last size of the exact 16-byte-step range.
const LINEAR_LIMIT: usize = 128;

/// How a class's pages are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// One class per page, free list and occupancy driven by CAS.
    Exclusive,
    /// Several small classes share a page; granule bitmap under a lock.
    Bitfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub index: usize,
    pub size: usize,
    /// Largest power of two dividing `size`, capped at `PAGE_SIZE`. Slots of
    /// an exclusive page are aligned to at least this.
    pub alignment: usize,
    pub objects_per_page: usize,
    pub kind: ViewKind,
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {} ({} B, {:?})", self.index, self.size, self.kind)
    }
}

/// Result of routing a request through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Segregated(usize),
    /// Above the segregated ceiling, or an alignment no class satisfies.
    Large,
}

pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    /// Class index by `ceil(size / 16)`.
    lut: Vec<u8>,
    max_size: usize,
}

impl SizeClassTable {
    /// Build the table for classes up to `max_object_size` (rounded up to the
    /// granule). Classes no larger than `bitfit_max_size` are bitfit classes.
    ///
    /// Bounds are checked by `HeapConfig::validate`.
    pub fn build(max_object_size: usize, bitfit_max_size: usize) -> Self {
        let max_size = max_object_size.next_multiple_of(MIN_ALIGN);
        debug_assert!(max_size <= PAGE_SIZE / 2, "max class {max_size} exceeds half a page");

        let mut sizes = Vec::new();
        let mut size = MIN_ALIGN;
        while size < max_size {
            sizes.push(size);
            size = if size < LINEAR_LIMIT {
                size + MIN_ALIGN
            } else {
                (size + size / 4).next_multiple_of(MIN_ALIGN)
            };
        }
        sizes.push(max_size);
        debug_assert!(sizes.len() <= usize::from(u8::MAX), "too many size classes");

        let classes: Vec<SizeClass> = sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| SizeClass {
                index,
                size,
                alignment: (1usize << size.trailing_zeros()).min(PAGE_SIZE),
                objects_per_page: PAGE_SIZE / size,
                kind: if size <= bitfit_max_size {
                    ViewKind::Bitfit
                } else {
                    ViewKind::Exclusive
                },
            })
            .collect();

        let quanta = max_size / MIN_ALIGN;
        let mut lut = vec![0u8; quanta + 1];
        let mut q = 1;
        for class in &classes {
            while q <= class.size / MIN_ALIGN {
                #[allow(clippy::cast_possible_truncation)]
                {
                    lut[q] = class.index as u8;
                }
                q += 1;
            }
        }

        Self {
            classes,
            lut,
            max_size,
        }
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    #[inline]
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Smallest class whose size is `>= size` and a multiple of `align`.
    ///
    /// Size 0 is served as size 1. `None` routes the request to the
    /// large-object path.
    #[inline]
    pub fn class_for(&self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let size = size.max(1);
        if size > self.max_size || align > PAGE_SIZE {
            return None;
        }

        let mut idx = usize::from(self.lut[size.div_ceil(MIN_ALIGN)]);
        // Small alignments are satisfied by every class; larger ones bump to
        // the next class whose size they divide.
        while idx < self.classes.len() {
            if self.classes[idx].size.is_multiple_of(align) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    #[inline]
    pub fn route(&self, size: usize, align: usize) -> Route {
        match self.class_for(size, align) {
            Some(idx) => Route::Segregated(idx),
            None => Route::Large,
        }
    }
}
