//! Strand - embedded HTTP/WebSocket server on a single-threaded fiber runtime.
//!
//! Core library: the fiber runtime, the HTTP connection state machine, and
//! the signature validator.

pub mod config;
pub mod error;
pub mod http;
pub mod json;
pub mod runtime;
pub mod server;
pub mod signature;

pub use error::{Error, Result};
