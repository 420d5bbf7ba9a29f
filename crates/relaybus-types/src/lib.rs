//! Shared domain types for relaybus.
//!
//! This crate contains the types exchanged across the bus boundary:
//! Envelope, Route, endpoint health, bus configuration, and the error enums.
//!
//! No async runtime here -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod route;
