pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod teardown;
pub mod telemetry;
