//! Observability setup for processes embedding the relaybus message bus.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, init_tracing_with, shutdown_tracing};
