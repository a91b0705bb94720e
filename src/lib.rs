pub mod api;
pub mod classification;
pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod state;
pub mod telemetry;
