//! Durable key-value storage backends.
//!
//! The `KeyValueStorage` trait itself lives in `relaykit-core`; this crate
//! provides implementations.

pub mod memory;

pub use memory::MemoryStorage;
