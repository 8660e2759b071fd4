//! Control API
//!
//! The exposed HTTP interface for modifying server state: queueing,
//! skipping, shuffling, and inspecting what's playing. Requests translate
//! into operations against the queue, cache, and mixer.

pub mod auth;
pub mod handlers;
pub mod server;
