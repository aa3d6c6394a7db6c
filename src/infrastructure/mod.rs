//! Infrastructure layer: adapters for everything the core engine treats
//! as an external collaborator — durable workflow storage, the knowledge
//! store, hierarchical configuration, structured logging, and the
//! reference sandbox/PR-creation implementations (§4.7, §6.3, §6.4).

pub mod config;
pub mod knowledge_store;
pub mod logging;
pub mod pr;
pub mod sandbox;
pub mod workflow_store;
