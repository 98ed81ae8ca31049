//! The synchronization core: one logical document reconciled between
//! memory, the local store and the remote replica, local side first.

pub mod engine;
