pub(crate) mod bits;
pub(crate) mod config;
pub(crate) mod diag;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod size_class;
pub(crate) mod slab;
pub(crate) mod stats;
#[cfg(test)]
pub(crate) mod testing;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
