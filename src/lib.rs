#[cfg(not(target_pointer_width = "64"))]
compile_error!("segheap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// heap
pub use memory::config::HeapConfig;
pub use memory::heap::{GlobalHeap, Heap};
pub use memory::scavenger::{ScavengeReport, Scavenger, ScavengerConfig};

// layout
pub use memory::arena::PAGE_SIZE;
pub use memory::compact::{CompactPtr, MIN_ALIGN};
pub use memory::size_class::{SizeClass, ViewKind};

// stats
pub use memory::stats::{HeapStatsSnapshot, ViewCensus};

// errors
pub use memory::error::AllocError;
pub use memory::vm::VmError;
