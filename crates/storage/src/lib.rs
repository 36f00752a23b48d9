//! Storage abstraction and implementations for LabMan.
//!
//! This crate provides a trait-based document store with a JSON-file
//! backend and an in-memory backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;

pub use trait_::{shared, Result, SharedStorage, Storage, StorageError};
pub use json_storage::JsonStorage;
pub use memory::MemoryStorage;
