//! Deterministic, pure logic shared by the solve engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod acceptance;
pub mod budget;
pub mod cancel;
pub mod provider;
pub mod truncate;
pub mod types;
