use crate::memory::arena::PAGE_SIZE;
use crate::memory::compact::{MAX_ENCODABLE_LEN, MIN_ALIGN};
use crate::memory::vm::VmError;

pub(crate) const DEFAULT_RESERVED_BYTES: usize = 256 * 1024 * 1024;

/// Configuration for [`Heap`](crate::Heap). All fields have sensible
/// defaults. Fixed for the lifetime of the heap.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Address space reserved for the arena, rounded down to whole pages.
    /// Default: 256 MiB.
    pub reserved_bytes: usize,

    /// Largest size served by a size class. Larger requests are reported as
    /// large objects. Default: 8 KiB. At most half a page.
    pub max_object_size: usize,

    /// Classes up to this size share bitfit pages; larger classes get
    /// exclusive pages. Default: 64. Zero disables bitfit pages.
    pub bitfit_max_size: usize,

    /// Objects claimed per thread-cache refill. Per class-size tier:
    /// `[<=256, <=1K, <=4K, larger]`. Default: `[16, 8, 4, 2]`.
    pub cache_batch: [u32; 4],

    /// Max objects a thread cache holds per class before returning them to
    /// the view. Same tiers. Default: `[64, 32, 8, 4]`.
    pub cache_limit: [u32; 4],
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reserved_bytes: DEFAULT_RESERVED_BYTES,
            max_object_size: 8 * 1024,
            bitfit_max_size: 64,
            cache_batch: [16, 8, 4, 2],
            cache_limit: [64, 32, 8, 4],
        }
    }
}

impl HeapConfig {
    /// Return tier index (0..3) for given class size.
    fn tier(class_size: usize) -> usize {
        if class_size <= 256 {
            0
        } else if class_size <= 1024 {
            1
        } else if class_size <= 4096 {
            2
        } else {
            3
        }
    }

    /// Refill batch for the given class size. Never zero.
    #[must_use]
    pub fn batch_size_for(&self, class_size: usize) -> u32 {
        self.cache_batch[Self::tier(class_size)].max(1)
    }

    /// Thread-cache capacity for the given class size.
    #[must_use]
    pub fn cache_limit_for(&self, class_size: usize) -> u32 {
        self.cache_limit[Self::tier(class_size)]
    }

    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` naming the first bad field.
    pub fn validate(&self) -> Result<(), VmError> {
        let fail = |msg: String| Err(VmError::InitializationFailed(msg));
        if self.reserved_bytes < PAGE_SIZE {
            return fail(format!(
                "reserved_bytes {} is smaller than one {PAGE_SIZE}-byte page",
                self.reserved_bytes
            ));
        }
        if self.reserved_bytes / PAGE_SIZE * PAGE_SIZE > MAX_ENCODABLE_LEN {
            return fail(format!(
                "reserved_bytes {} exceeds the compact pointer range",
                self.reserved_bytes
            ));
        }
        if self.max_object_size < MIN_ALIGN || self.max_object_size > PAGE_SIZE / 2 {
            return fail(format!(
                "max_object_size {} must be within {MIN_ALIGN}..={}",
                self.max_object_size,
                PAGE_SIZE / 2
            ));
        }
        if self.bitfit_max_size > self.max_object_size {
            return fail(format!(
                "bitfit_max_size {} exceeds max_object_size {}",
                self.bitfit_max_size, self.max_object_size
            ));
        }
        Ok(())
    }
}
