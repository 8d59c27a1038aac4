//! Deterministic, pure logic shared by the orchestration layers.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (callers pass the current time where it matters) and
//! return deterministic outputs suitable for tests.

pub mod backoff;
pub mod circuit;
pub mod graph;
pub mod requirements;
pub mod types;
