//! Fixed-size atomic bitmap, indexed by page (directory view sets) or by
//! slot (debug live maps).

use crate::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl AtomicBitmap {
    pub(crate) fn new(bits: usize) -> Self {
        let words = (0..bits.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, bits }
    }

    #[inline]
    fn locate(&self, index: usize) -> (&AtomicU64, u64) {
        debug_assert!(index < self.bits, "bit {index} out of range {}", self.bits);
        (&self.words[index / WORD_BITS], 1u64 << (index % WORD_BITS))
    }

    /// Set bit `index`; returns whether it was already set.
    #[inline]
    pub(crate) fn set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear bit `index`; returns whether it was set.
    #[inline]
    pub(crate) fn clear(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    #[inline]
    pub(crate) fn contains(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Set bits below `limit`, word by word. Each word is a snapshot taken as
    /// the iterator reaches it; bits flipped concurrently may or may not be
    /// seen.
    pub(crate) fn iter_ones(&self, limit: usize) -> Ones<'_> {
        Ones {
            bitmap: self,
            limit: limit.min(self.bits),
            word_index: 0,
            current: 0,
        }
    }
}

pub(crate) struct Ones<'a> {
    bitmap: &'a AtomicBitmap,
    limit: usize,
    word_index: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                let index = (self.word_index - 1) * WORD_BITS + bit;
                if index >= self.limit {
                    return None;
                }
                return Some(index);
            }
            if self.word_index * WORD_BITS >= self.limit {
                return None;
            }
            self.current = self.bitmap.words[self.word_index].load(Ordering::Acquire);
            self.word_index += 1;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_contains() {
        let bitmap = AtomicBitmap::new(130);
        assert!(!bitmap.set(0));
        assert!(bitmap.set(0));
        assert!(!bitmap.set(129));
        assert!(bitmap.contains(129));
        assert!(bitmap.clear(0));
        assert!(!bitmap.clear(0));
        assert!(!bitmap.contains(0));
        assert_eq!(bitmap.iter_ones(130).collect::<Vec<_>>(), vec![129]);
        assert!(!bitmap.is_clear());
    }

    #[test]
    fn test_iter_ones_across_words() {
        let bitmap = AtomicBitmap::new(200);
        for i in [1, 63, 64, 127, 128, 199] {
            bitmap.set(i);
        }
        let ones: Vec<_> = bitmap.iter_ones(200).collect();
        assert_eq!(ones, vec![1, 63, 64, 127, 128, 199]);
    }

    #[test]
    fn test_iter_ones_respects_limit() {
        let bitmap = AtomicBitmap::new(200);
        for i in [3, 64, 70, 150] {
            bitmap.set(i);
        }
        let ones: Vec<_> = bitmap.iter_ones(70).collect();
        assert_eq!(ones, vec![3, 64]);
        assert_eq!(bitmap.iter_ones(0).count(), 0);
    }
}
