//! Compact arena-relative pointers.
//!
//! A [`CompactPtr`] is a `u32` holding `((addr - base) / MIN_ALIGN) + 1`, with
//! `0` reserved for null. Every heap metadata link (free-list heads, in-slot
//! free-list links) is stored this way, which halves link storage and lets a
//! free-list head pair a pointer with an ABA tag in one 64-bit word.
//!
//! The codec takes the arena base explicitly. There is no process-global base
//! lookup; several heaps may coexist.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU64, Ordering};

/// Granule of the compact encoding. Every encodable address is a multiple of
/// this relative to the arena base.
pub const MIN_ALIGN: usize = 16;

/// Largest arena span addressable by a `u32` compact pointer.
pub const MAX_ENCODABLE_LEN: usize = (u32::MAX as usize) * MIN_ALIGN;

/// Narrow, arena-relative reference to a `T`.
pub struct CompactPtr<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CompactPtr<T> {
    pub const NULL: Self = Self::from_raw(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.raw
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.raw == 0
    }

    #[inline]
    pub const fn cast<U>(self) -> CompactPtr<U> {
        CompactPtr::from_raw(self.raw)
    }
}

impl<T> Clone for CompactPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CompactPtr<T> {}

impl<T> PartialEq for CompactPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for CompactPtr<T> {}

impl<T> fmt::Debug for CompactPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("CompactPtr(null)")
        } else {
            write!(f, "CompactPtr({:#x})", self.raw)
        }
    }
}

/// Encode `ptr`, or `None` if it lies outside `[base, base + len)` or is not
/// `MIN_ALIGN`-aligned relative to `base`.
#[inline]
pub fn try_encode<T>(base: NonNull<u8>, len: usize, ptr: NonNull<T>) -> Option<CompactPtr<T>> {
    let offset = (ptr.as_ptr() as usize).checked_sub(base.as_ptr() as usize)?;
    if offset >= len || offset >= MAX_ENCODABLE_LEN || !offset.is_multiple_of(MIN_ALIGN) {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let raw = (offset / MIN_ALIGN) as u32 + 1;
    Some(CompactPtr::from_raw(raw))
}

/// Encode `ptr` relative to the arena at `base`.
///
/// # Panics
/// If `ptr` is outside the arena or misaligned. Either means a corrupted
/// pointer reached heap metadata; there is no recovery.
#[inline]
pub fn encode<T>(base: NonNull<u8>, len: usize, ptr: NonNull<T>) -> CompactPtr<T> {
    match try_encode(base, len, ptr) {
        Some(compact) => compact,
        None => panic!(
            "compact encode of {:p} outside arena {:p}+{len:#x} or not {MIN_ALIGN}-aligned",
            ptr.as_ptr(),
            base.as_ptr()
        ),
    }
}

/// Decode a compact pointer. Null decodes to `None`.
#[inline]
pub fn decode<T>(base: NonNull<u8>, compact: CompactPtr<T>) -> Option<NonNull<T>> {
    if compact.is_null() {
        return None;
    }
    let offset = (compact.raw() as usize - 1) * MIN_ALIGN;
    NonNull::new(base.as_ptr().wrapping_add(offset)).map(NonNull::cast::<T>)
}

// ---------------------------------------------------------------------------
// Tagged compact word
// ---------------------------------------------------------------------------

/// `(CompactPtr raw, tag)` packed into one `u64`: pointer in the low half,
/// tag in the high half.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaggedCompact(u64);

impl TaggedCompact {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn new(ptr: u32, tag: u32) -> Self {
        Self(((tag as u64) << 32) | ptr as u64)
    }

    #[inline]
    pub const fn ptr(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.0 as u32
        }
    }

    #[inline]
    pub const fn tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for TaggedCompact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedCompact")
            .field("ptr", &self.ptr())
            .field("tag", &self.tag())
            .finish()
    }
}

/// Single-word atomic holding a [`TaggedCompact`].
///
/// Free-list heads live here. Writers publish with `Release` so that the
/// in-slot link written before the CAS is visible to an `Acquire` reader.
pub struct AtomicTaggedCompact(AtomicU64);

impl AtomicTaggedCompact {
    pub fn new(value: TaggedCompact) -> Self {
        Self(AtomicU64::new(value.bits()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedCompact {
        TaggedCompact::from_bits(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: TaggedCompact, order: Ordering) {
        self.0.store(value.bits(), order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedCompact,
        new: TaggedCompact,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedCompact, TaggedCompact> {
        self.0
            .compare_exchange(current.bits(), new.bits(), success, failure)
            .map(TaggedCompact::from_bits)
            .map_err(TaggedCompact::from_bits)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedCompact,
        new: TaggedCompact,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedCompact, TaggedCompact> {
        self.0
            .compare_exchange_weak(current.bits(), new.bits(), success, failure)
            .map(TaggedCompact::from_bits)
            .map_err(TaggedCompact::from_bits)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fake_base() -> NonNull<u8> {
        NonNull::new(0x7f00_0000_0000 as *mut u8).unwrap()
    }

    // Address arithmetic only; these pointers are never dereferenced.
    fn at(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
        NonNull::new(base.as_ptr().wrapping_add(offset)).unwrap()
    }

    #[test]
    fn test_base_encodes_to_one() {
        let base = fake_base();
        let compact = encode(base, 4096, base);
        assert_eq!(compact.raw(), 1);
        assert!(!compact.is_null());
        assert_eq!(decode(base, compact), Some(base));
    }

    #[test]
    fn test_null_decodes_to_none() {
        assert_eq!(decode::<u8>(fake_base(), CompactPtr::NULL), None);
        assert!(CompactPtr::<u64>::NULL.is_null());
    }

    #[test]
    fn test_roundtrip_over_range() {
        let base = fake_base();
        let len = 1 << 20;
        for offset in (0..len).step_by(MIN_ALIGN * 97) {
            let p = at(base, offset);
            let compact = encode(base, len, p);
            assert_eq!(decode(base, compact), Some(p), "offset {offset:#x}");
        }
    }

    #[test]
    fn test_encode_is_injective_and_ordered() {
        let base = fake_base();
        let a = encode(base, 1024, at(base, 16));
        let b = encode(base, 1024, at(base, 32));
        assert_ne!(a, b);
        assert!(a.raw() < b.raw());
    }

    #[test]
    fn test_try_encode_rejects_outside_and_misaligned() {
        let base = fake_base();
        let end = at(base, 4096);
        let odd = at(base, 8);
        let below = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(try_encode(base, 4096, end).is_none());
        assert!(try_encode(base, 4096, odd).is_none());
        assert!(try_encode(base, 4096, below).is_none());
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn test_encode_outside_panics() {
        let base = fake_base();
        let end = at(base, 4096);
        let _ = encode(base, 4096, end);
    }

    #[test]
    fn test_tagged_packing() {
        let word = TaggedCompact::new(0xdead_beef, 7);
        assert_eq!(word.ptr(), 0xdead_beef);
        assert_eq!(word.tag(), 7);
        assert_eq!(TaggedCompact::from_bits(word.bits()), word);
        assert_eq!(TaggedCompact::EMPTY.ptr(), 0);
    }

    #[test]
    fn test_atomic_tagged_cas() {
        let head = AtomicTaggedCompact::new(TaggedCompact::EMPTY);
        let next = TaggedCompact::new(5, 2);
        assert!(
            head.compare_exchange(TaggedCompact::EMPTY, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        );
        // Same pointer, stale tag: must fail.
        let stale = TaggedCompact::new(5, 0);
        assert_eq!(
            head.compare_exchange(stale, TaggedCompact::EMPTY, Ordering::AcqRel, Ordering::Acquire),
            Err(next)
        );
    }
}
