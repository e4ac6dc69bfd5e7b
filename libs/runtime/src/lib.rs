pub mod assembler;
pub mod config;
pub mod dependents;
pub mod document;
pub mod engine;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod refwatch;
pub mod syncer;
pub mod telemetry;
pub mod transport;
