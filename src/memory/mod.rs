pub mod block_pool;
pub mod block_stack;
pub mod debugging;
pub mod erased;
pub mod error;
pub mod handle;
pub mod heap;
pub(crate) mod integration;
pub mod lock;
pub(crate) mod loom_tests;
pub mod size_class;
pub mod stats;
pub mod storage;
pub mod traits;
pub mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
