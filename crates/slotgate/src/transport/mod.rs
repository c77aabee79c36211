//! Transport layer for slotgate.
//!
//! Currently provides the HTTP control surface via axum.

pub mod http;

pub use http::{ServerConfig, serve};
