//! Domain layer for the Fleetlift orchestration engine.
//!
//! This module contains the core business logic and domain models: the
//! Task record, the control-file document types exchanged with the
//! sandbox, the durable workflow's state shapes, and the ports the
//! engine consumes (sandbox provider, PR creator, knowledge store).

pub mod error;
pub mod models;
pub mod ports;

pub use error::FleetliftError;
