//! Domain library for the crucible execution worker.
//!
//! This crate holds the runtime-agnostic pieces of the worker: build-env
//! rules (stage definitions, resource limits, target resolution), the
//! test-check evaluator, the sandbox argv builder, and the wire envelope
//! types. The async runtime, sockets, and child processes live in
//! `crucible-worker`.

pub mod checks;
pub mod jail;
pub mod protocol;
pub mod rules;
