// Synchronization primitives, switched to `loom` under `cfg(loom)`.
//
// Every atomic, lock and thread the heap touches is imported from here. An
// import straight from `std::sync` hides that operation from loom's scheduler
// and the model checker silently explores less than it claims to.
//
// Free-list heads are a compact pointer and a tag packed into one u64, so no
// 128-bit atomics are needed.
#![allow(unused_imports)]

pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };
}

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

// Heap handles and thread-cache registrations need weak references, which
// loom's Arc lacks. Their refcounts are not modelled, so both builds use std.
pub(crate) mod handle {
    pub(crate) use std::sync::{Arc, Weak};
}

// Only ever initialised outside a loom model (the global heap, the OS page
// size), so std's is used in both builds.
pub(crate) use std::sync::OnceLock;

pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::UnsafeCell;

    #[cfg(not(loom))]
    pub(crate) use std::cell::UnsafeCell;
}

/// `&mut T` out of a `sync::cell::UnsafeCell<T>`, for either build. loom's
/// cell hands out access through a closure instead of a raw pointer.
///
/// # Safety
/// The caller guarantees exclusive access.
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

pub(crate) mod hint {
    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;
}

pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, spawn, yield_now};

    /// Spawn a thread named `name`. loom threads have no names.
    pub(crate) fn spawn_named<F>(name: &str, f: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        #[cfg(not(loom))]
        {
            std::thread::Builder::new().name(name.to_owned()).spawn(f)
        }
        #[cfg(loom)]
        {
            let _ = name;
            Ok(loom::thread::spawn(f))
        }
    }
}


/// A `static` holding a sync primitive. loom's primitives cannot be built in
/// a const context and must be fresh for every model run, so under loom the
/// static goes through `loom::lazy_static!`.
#[allow(unused_macro_rules)]
macro_rules! loom_static {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use loom_static;
