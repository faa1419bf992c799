//! Session subsystem: durable state model, SQLite-backed store, the
//! single-writer actor, and the registry that owns actor lifecycles.

pub mod actor;
pub mod registry;
pub mod state;
pub mod store;
