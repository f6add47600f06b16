//! Storage backends for cache entries, queued mutations, and conflicts.
//!
//! The engine only ever sees the traits in [`traits`]; deployments choose
//! between the in-memory stores ([`memory`]) and the durable SQLite stores
//! ([`sqlite`]).

pub mod traits;
pub mod memory;
pub mod sqlite;
