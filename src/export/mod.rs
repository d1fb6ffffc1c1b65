//! Outward surfaces: engine self-metrics and the HTTP server.

pub mod health;
pub mod server;
