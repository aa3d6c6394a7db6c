//! Client-facing services layer (§6.2): the operations a transport
//! (CLI, RPC) drives to start and interact with a transform workflow.

pub mod client_api;

pub use client_api::{ClientApi, ClientApiError};
