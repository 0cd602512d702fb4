//! # Storage Module
//!
//! Persistent record sets for the engine's aggregates. One sled tree per
//! entity type, records keyed by id, bincode on disk.
//!
//! Components follow a write-through discipline: build the updated
//! aggregate, persist it, and only then swap it into memory while still
//! holding the aggregate's mutex. On startup each component reloads its
//! collection with [`Store::load_all`].

pub mod db;

pub use db::{Collection, Store, StoreError, StoreResult, Write};
