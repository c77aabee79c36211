//! Slot policies hosted in another process.
//!
//! - **protocol**: request/response frames and cross-boundary validation errors
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **client**: [`BridgedSlotSupplier`], the worker-side supplier
//! - **host**: [`serve_policy`], which exposes a local supplier over a stream

pub mod codec;
pub mod protocol;

mod client;
mod host;

pub use client::BridgedSlotSupplier;
pub use host::{BridgeError, serve_policy};
pub use protocol::CrossBoundaryValidationError;
