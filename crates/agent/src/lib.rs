//! Fleet agent wiring: configuration and the health/metrics HTTP API

pub mod api;
pub mod config;
