//! Deterministic, pure logic shared by the session loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for exhaustive tests.

pub mod plan;
pub mod transition;
pub mod types;
