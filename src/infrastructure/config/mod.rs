//! Worker configuration infrastructure.
//!
//! Hierarchical configuration using `figment`: programmatic defaults, a
//! project YAML file, then environment variable overrides (`FLEETLIFT_`
//! prefix), validated after extraction (SPEC_FULL.md §2 ambient stack).

mod loader;

pub use loader::{ConfigError, ConfigLoader};

use serde::{Deserialize, Serialize};

use crate::infrastructure::logging::config::LogConfig;

/// Durable-runtime connection settings (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    #[serde(default = "default_temporal_address")]
    pub address: String,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            address: default_temporal_address(),
        }
    }
}

fn default_temporal_address() -> String {
    "localhost:7233".to_string()
}

/// Sandbox provisioning defaults consumed by the reference
/// `LocalProcessSandboxProvider` (SPEC_FULL.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base directory under which per-sandbox workspaces are created.
    #[serde(default = "default_sandbox_base_dir")]
    pub base_dir: String,
    /// Control-file subdirectory name within each sandbox workspace
    /// (§6.1: `/workspace/.fleetlift/` by default).
    #[serde(default = "default_control_dir")]
    pub control_dir_name: String,
    /// Path to the `fleetlift-agent` binary the provider launches.
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    /// Skip sandbox cleanup for debugging (§6.4 `DEBUG_NO_CLEANUP`).
    #[serde(default)]
    pub debug_no_cleanup: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: default_sandbox_base_dir(),
            control_dir_name: default_control_dir(),
            agent_binary: default_agent_binary(),
            debug_no_cleanup: false,
        }
    }
}

fn default_sandbox_base_dir() -> String {
    "/tmp/fleetlift/sandboxes".to_string()
}

fn default_control_dir() -> String {
    ".fleetlift".to_string()
}

fn default_agent_binary() -> String {
    "fleetlift-agent".to_string()
}

/// Persisted-state paths (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_workflow_db")]
    pub workflow_db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workflow_db_path: default_workflow_db(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.fleetlift".to_string()
}

fn default_workflow_db() -> String {
    "~/.fleetlift/workflows.db".to_string()
}

/// The worker process's full configuration, assembled by `ConfigLoader`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub temporal: TemporalConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LogConfig,
    /// Fail worker startup on incomplete config rather than falling back
    /// to defaults (§6.4 `REQUIRE_CONFIG`).
    #[serde(default)]
    pub require_config: bool,
}
