//! Worker runtime for the crucible execution service.
//!
//! One backend connection is handled by a pair of transport loops plus a
//! per-request driver; each request drives user sources through an
//! ordered chain of sandboxed subprocess stages and streams output and
//! verdicts back over the same connection. The binary in `main.rs` is a
//! thin shell over this crate so the integration tests can exercise the
//! full lifecycle in-process.

pub mod config;
pub mod framing;
pub mod ingest;
pub mod request;
pub mod stage;
pub mod transport;
