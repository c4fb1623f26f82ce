pub mod auth;
pub mod models;
pub mod server;
pub mod telemetry;
