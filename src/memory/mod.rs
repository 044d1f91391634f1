pub(crate) mod arena;
pub(crate) mod bitfit;
pub(crate) mod bitmap;
pub(crate) mod compact;
pub(crate) mod config;
pub(crate) mod directory;
pub(crate) mod error;
pub(crate) mod exclusive;
pub(crate) mod freelist;
pub(crate) mod heap;
pub(crate) mod scavenger;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod thread_cache;
pub(crate) mod view;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::loom_static! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
