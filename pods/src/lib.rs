//! File-based Pod orchestration engine.
//!
//! A Pod is a supervisor plus one or more workers that exchange immutable
//! JSON documents through a directory: the supervisor writes instructions,
//! workers write results, the supervisor evaluates and either accepts or
//! retries with the gaps it found. Pods compose into chains (sequential,
//! rolled back on failure) and chains into workflows (DAGs with retries and
//! per-step circuit breakers).
//!
//! - **[`core`]**: Pure, deterministic logic (requirements, graph, breaker,
//!   backoff). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (file channel, layout, config,
//!   child processes, prompts).
//!
//! Orchestration modules ([`pod`], [`chain`], [`workflow`]) coordinate core
//! logic with I/O; [`registry`] holds the per-run shared state.

pub mod chain;
pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pod;
pub mod registry;
pub mod roles;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
