//! Deterministic, pure logic shared by the step state machine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cancel;
pub mod critique;
pub mod progress;
pub mod types;
pub mod variables;
