//! Background reclamation of idle memory.
//!
//! A pass trims the caches of threads that have gone quiet, then decommits
//! the pages of EMPTY views. Both steps only ever try-lock: a cache in use or
//! a view under its lock is skipped and looked at again next pass, so the
//! scavenger never stalls an allocating thread.

use std::time::Duration;

use crate::memory::heap::{Heap, HeapShared};
use crate::memory::view::ViewState;
use crate::sync::handle::Arc;
use crate::sync::thread::{self, JoinHandle};
use crate::sync::{Condvar, Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub struct ScavengerConfig {
    /// Time between passes while enabled. Default: 100 ms.
    pub interval: Duration,
    /// A thread cache left untouched for this many consecutive passes is
    /// returned to its views. Default: 2.
    pub cache_idle_passes: u32,
    /// Whether the worker starts running passes right away. Default: true.
    pub start_enabled: bool,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            cache_idle_passes: 2,
            start_enabled: true,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeReport {
    pub pages_decommitted: usize,
    /// Decommits the OS refused. Those pages stay committed and are retried
    /// next pass.
    pub decommit_failures: usize,
    pub caches_trimmed: usize,
    pub slots_returned: usize,
}

struct Control {
    enabled: bool,
    stopped: bool,
}

struct Shared {
    heap: Arc<HeapShared>,
    config: ScavengerConfig,
    control: Mutex<Control>,
    wake: Condvar,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn run_loop(&self) {
        let mut control = self.control();
        loop {
            if control.stopped {
                return;
            }
            if !control.enabled {
                control = self
                    .wake
                    .wait(control)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            let (guard, timeout) = self
                .wake
                .wait_timeout(control, self.config.interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            control = guard;
            if timeout.timed_out() && control.enabled && !control.stopped {
                drop(control);
                scavenge(&self.heap, &self.config);
                control = self.control();
            }
        }
    }
}

/// Owner of the background scavenging thread for one heap.
pub struct Scavenger {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scavenger {
    /// Start a scavenger for `heap`.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the worker thread cannot be started.
    pub fn new(heap: &Heap, config: ScavengerConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            heap: Arc::clone(heap.shared()),
            control: Mutex::new(Control {
                enabled: config.start_enabled,
                stopped: false,
            }),
            config,
            wake: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn_named("segheap-scavenger", move || shared.run_loop())?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn enable(&self) {
        self.shared.control().enabled = true;
        self.shared.wake.notify_all();
    }

    /// Pause periodic passes. A pass already running finishes.
    pub fn disable(&self) {
        self.shared.control().enabled = false;
        self.shared.wake.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        let control = self.shared.control();
        control.enabled && !control.stopped
    }

    /// Run one pass on the calling thread, regardless of the enabled flag.
    pub fn run_once(&self) -> ScavengeReport {
        scavenge(&self.shared.heap, &self.shared.config)
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&self) {
        {
            let mut control = self.shared.control();
            control.stopped = true;
            control.enabled = false;
        }
        self.shared.wake.notify_all();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if worker.is_some_and(|worker| worker.join().is_err()) {
            log::warn!("segheap: scavenger thread panicked");
        }
    }
}

impl Drop for Scavenger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One scavenging pass over `heap`.
pub(crate) fn scavenge(heap: &HeapShared, config: &ScavengerConfig) -> ScavengeReport {
    let mut report = ScavengeReport::default();
    trim_idle_caches(heap, config, &mut report);
    decommit_empty_views(heap, &mut report);
    if report != ScavengeReport::default() {
        log::debug!(
            "segheap: scavenged {} pages ({} failed), trimmed {} caches ({} objects)",
            report.pages_decommitted,
            report.decommit_failures,
            report.caches_trimmed,
            report.slots_returned
        );
    }
    report
}

fn trim_idle_caches(heap: &HeapShared, config: &ScavengerConfig, report: &mut ScavengeReport) {
    for slot in heap.registered_caches() {
        if slot.note_pass() < config.cache_idle_passes {
            continue;
        }
        let Some(mut guard) = slot.try_acquire() else {
            continue;
        };
        let returned = guard.cache().drain(heap);
        drop(guard);
        slot.reset_idle();
        if returned > 0 {
            report.caches_trimmed += 1;
            report.slots_returned += returned as usize;
        }
    }
}

fn decommit_empty_views(heap: &HeapShared, report: &mut ScavengeReport) {
    let limit = heap.arena.pages_in_use();
    for sets in heap.directory.all_sets() {
        for page in sets.empty.iter_ones(limit) {
            let Some(view) = heap.pages.get(page) else {
                continue;
            };
            if !view.try_begin_decommit() {
                continue;
            }
            view.reset_slots();
            let result = heap.arena.decommit_page(page);
            if let Err(e) = &result {
                log::warn!("segheap: failed to decommit page {page}: {e}");
                report.decommit_failures += 1;
            } else {
                report.pages_decommitted += 1;
            }
            let transition = view.end_busy(result.is_err());
            debug_assert_eq!(transition.after.state(), ViewState::Empty);
        }
    }
}
