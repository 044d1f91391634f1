//! OS virtual memory calls behind the arena.
//!
//! The arena needs four things from the OS: an inaccessible, aligned range
//! of address space; making a page of it usable; giving a page's physical
//! memory back without losing the address range; and unmapping the whole
//! range when the heap goes away.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(io::Error),
    CommitFailed(io::Error),
    DecommitFailed(io::Error),
    ReleaseFailed(io::Error),
    /// Rejected before any OS call: bad configuration or a repeated
    /// one-time setup.
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (what, err) = match self {
            VmError::ReservationFailed(e) => ("reserve address space", e),
            VmError::CommitFailed(e) => ("commit page", e),
            VmError::DecommitFailed(e) => ("decommit page", e),
            VmError::ReleaseFailed(e) => ("release address space", e),
            VmError::InitializationFailed(msg) => {
                return write!(f, "segheap setup rejected: {msg}");
            }
        };
        write!(f, "segheap could not {what}: {err}")
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Virtual memory primitives, one implementation per platform.
///
/// `commit` and `decommit` are idempotent. Nothing here logs; callers decide
/// what a failure means.
pub(crate) trait VmOps {
    /// Reserve `len` bytes of inaccessible address space starting at a
    /// multiple of `align`. `len` and `align` are multiples of
    /// [`page_size`](Self::page_size), `align` a power of two.
    unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Make `len` bytes at `ptr`, inside a reservation, readable and writable.
    /// Contents are unspecified.
    unsafe fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Drop the physical memory behind `len` bytes at `ptr` and make the
    /// range inaccessible again. The address range stays reserved.
    unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// Unmap a range returned by [`reserve`](Self::reserve), with the same
    /// `len` and `align`.
    unsafe fn release(ptr: NonNull<u8>, len: usize, align: usize) -> Result<(), VmError>;

    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(not(any(unix, loom, miri)))]
compile_error!("segheap has a virtual memory backend for unix targets only.");

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use crate::sync::OnceLock;
    use std::io;

    /// Map a libc status return to `Ok` or the current `errno`.
    fn check(ret: libc::c_int, wrap: fn(io::Error) -> VmError) -> Result<(), VmError> {
        if ret == 0 {
            Ok(())
        } else {
            Err(wrap(io::Error::last_os_error()))
        }
    }

    #[cfg(target_os = "linux")]
    const RECLAIM: libc::c_int = libc::MADV_DONTNEED;
    #[cfg(not(target_os = "linux"))]
    const RECLAIM: libc::c_int = libc::MADV_FREE;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            if len == 0 {
                return Err(VmError::ReservationFailed(io::ErrorKind::InvalidInput.into()));
            }
            // mmap only guarantees OS-page alignment: map the slack too, then
            // unmap whatever lies outside the aligned window.
            let slack = align.saturating_sub(Self::page_size());
            let span = len
                .checked_add(slack)
                .ok_or_else(|| VmError::ReservationFailed(io::ErrorKind::InvalidInput.into()))?;
            // Safety: anonymous mapping, no address hint.
            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    span,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            let start = raw as usize;
            let head = start.next_multiple_of(align) - start;
            let tail = slack - head;
            let raw = raw.cast::<u8>();
            if head > 0 {
                // Safety: the first `head` bytes of our own mapping.
                check(unsafe { libc::munmap(raw.cast(), head) }, VmError::ReservationFailed)?;
            }
            if tail > 0 {
                // Safety: the last `tail` bytes of our own mapping.
                let ret = unsafe { libc::munmap(raw.add(head + len).cast(), tail) };
                check(ret, VmError::ReservationFailed)?;
            }
            // Safety: `head < span`, inside the mapping.
            NonNull::new(unsafe { raw.add(head) })
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            let prot = libc::PROT_READ | libc::PROT_WRITE;
            // Safety: the caller passes a range inside a reservation.
            check(
                unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot) },
                VmError::CommitFailed,
            )
        }

        unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // Safety: the caller passes a range inside a reservation.
            check(
                unsafe { libc::madvise(ptr.as_ptr().cast(), len, RECLAIM) },
                VmError::DecommitFailed,
            )?;
            // Safety: as above.
            check(
                unsafe { libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_NONE) },
                VmError::DecommitFailed,
            )
        }

        unsafe fn release(ptr: NonNull<u8>, len: usize, _align: usize) -> Result<(), VmError> {
            // Safety: the caller passes a whole reservation, trimmed to `len`.
            check(
                unsafe { libc::munmap(ptr.as_ptr().cast(), len) },
                VmError::ReleaseFailed,
            )
        }

        fn page_size() -> usize {
            static PAGE: OnceLock<usize> = OnceLock::new();
            *PAGE.get_or_init(|| {
                // Safety: sysconf has no preconditions.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw)
                    .ok()
                    .filter(|size| size.is_power_of_two())
                    .unwrap_or(4096)
            })
        }
    }
}

// Under loom and Miri a reservation is an ordinary aligned heap block, and
// commit/decommit do nothing. Page protection is covered by the unix tests.
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(len: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let layout = std::alloc::Layout::from_size_align(len, align)
            .ok()
            .filter(|layout| layout.size() > 0)
            .ok_or_else(|| VmError::ReservationFailed(io::ErrorKind::InvalidInput.into()))?;
        // Safety: non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| VmError::ReservationFailed(io::ErrorKind::OutOfMemory.into()))
    }

    unsafe fn commit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, len: usize, align: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(len, align)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: allocated by `reserve` with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
