//! Recursive investigation agent engine.
//!
//! Given an objective, the engine runs a model in a tool-use loop against a
//! sandboxed workspace, delegates sub-objectives to bounded child
//! investigations, and records every step in an append-only session log.
//!
//! - **[`core`]**: Pure, deterministic logic (budgets, truncation, provider
//!   inference, acceptance checks). No I/O.
//! - **[`io`]**: Side-effecting operations (configuration, sandbox, model
//!   backends, session files).
//!
//! Orchestration modules ([`engine`], [`events`], [`runtime`]) combine the two
//! into the `bootstrap` / `solve` contract the CLI calls.

pub mod core;
pub mod engine;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
