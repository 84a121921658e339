#![deny(clippy::await_holding_refcell_ref)]

pub mod cleanup;
pub mod cloud;
pub mod common;
pub mod config;
pub mod provision;
pub mod run;
pub mod split;
pub mod status;
pub mod storage;
pub mod submit;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ElbError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = fxhash::FxHashMap<K, V>;
pub type Set<T> = fxhash::FxHashSet<T>;

/// Dense, 0-based index of a query batch. Doubles as the job name suffix.
pub type BatchId = usize;

pub const ELB_VERSION: &str = {
    match option_env!("ELB_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
