//! Preview Core - Shared wire types
//!
//! This crate contains the request and response bodies of the preview
//! orchestrator's JSON API. They are shared between `preview-server` and any
//! client (the chat backend, integration tests) that talks to it over HTTP.
//!
//! All process, git and proxy functionality lives in the `preview-server` crate.

mod protocol;

pub use protocol::*;
