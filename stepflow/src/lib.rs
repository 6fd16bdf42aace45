//! Human-gated, resumable step execution for objective-driven agent runs.
//!
//! An objective is turned into an approved plan of steps. Each step is executed,
//! validated, and learned from with a bounded retry budget, then shown to a human
//! before it is checkpointed. A final writer phase produces a todo list that is
//! checked by a structural critique. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, placeholder substitution,
//!   resume windows, critique). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, child processes, prompts,
//!   console gateway). Isolated to enable mocking in tests.
//! - **[`agents`]**: Collaborator seams and the command-backed implementation.
//!
//! Orchestration modules ([`learning`], [`step_runner`], [`execution`], [`approval`],
//! [`writer`], [`run`]) coordinate core logic with I/O to implement CLI commands.

pub mod agents;
pub mod approval;
pub mod core;
pub mod execution;
pub mod exit_codes;
pub mod io;
pub mod learning;
pub mod logging;
pub mod run;
pub mod step_runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod writer;
