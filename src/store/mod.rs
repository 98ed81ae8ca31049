//! Storage contracts for the two replicas of a synchronized document:
//! [local::LocalStore] is the synchronous, durable, profile-scoped
//! side; [remote::RemoteStore] is the asynchronous replicated one.
//! Both are thin: values are opaque strings, interpretation belongs to
//! the sync engine.

pub mod local;
pub mod remote;
