//! Courier worker: processes persisted tasks through the delivery stages
//!
//! Binaries:
//! - `courier-worker` claims tasks from PostgreSQL and runs the delivery pipeline
//! - `mock-services` serves stand-ins for the auth and delivery endpoints
//! - `seed-tasks` ingests sample messages through the consumer loop

pub mod config;
pub mod mock;
pub mod seed;
pub mod telemetry;

pub use config::WorkerConfig;
pub use telemetry::{init_telemetry, TelemetryConfig};
