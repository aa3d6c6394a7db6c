//! Fleetlift - durable orchestration engine for fleet-wide code
//! transformations and discovery across many repositories.
//!
//! This crate is the core specified in SPEC_FULL.md: the durable
//! transform workflow, the bounded-concurrency group scheduler, the
//! in-sandbox agent pipeline, and the file-based protocol between them.
//! The CLI, YAML task-file loader, web UI, and concrete sandbox
//! providers are external collaborators; only the reference
//! single-machine provider and `gh`-based PR creator ship here.

pub mod agent;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::error::FleetliftError;
pub use domain::models::task::Task;
pub use services::client_api::{ClientApi, ClientApiError};
