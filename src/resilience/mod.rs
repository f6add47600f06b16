//! Fault-tolerance helpers shared by the storage and transport layers.

pub mod retry;
