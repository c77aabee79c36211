//! HTTP control surface (axum).

mod routes;
mod server;

pub use routes::{HealthCheckResponse, PauseResponse, routes};
pub use server::{ServerConfig, serve};
