//! Reload-proof stopwatch: the in-progress session is persisted once
//! at start and elapsed time is always recomputed from wall clock, so
//! a restart resumes at the true elapsed time instead of zero.

pub mod manager;
pub mod ticker;
