//! Cross-process bridge between the orchestrator and the worker process.
//!
//! # Architecture
//!
//! - **protocol**: Exit codes, slot payload types, the [`protocol::RemoteError`] variant
//! - **codec**: JSON encoding of slot payloads with a never-failing error path

pub mod codec;
pub mod protocol;
