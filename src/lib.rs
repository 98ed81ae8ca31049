//! Local-first state engine for a personal activity log. One logical
//! document (the list of logged activities) is kept consistent between
//! memory, a durable profile-local store, and a replicated remote
//! store, and a stopwatch session survives process restarts by
//! recomputing elapsed time from its persisted start instant.
//!
//! Rendering (tables, charts, forms) is left to the embedding UI; this
//! crate only owns the synchronized state and the session machinery.

pub mod model;
pub mod session;
pub mod store;
pub mod sync;
pub mod utils;
