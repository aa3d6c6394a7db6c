//! `fleetlift-agent`: the in-sandbox process (§4.4). Launched by a
//! `SandboxProvider` inside the provisioned environment, this binary
//! just installs signal handlers and hands off to `fleetlift::agent::run`,
//! which owns the actual manifest-poll / clone / execute / verify /
//! steer / PR-create phase sequence.

use std::path::PathBuf;

use fleetlift::agent::shutdown::{install_signal_handlers, Shutdown};
use fleetlift::infrastructure::pr::GhPullRequestCreator;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("FLEETLIFT_AGENT_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(log_level);
    tracing_subscriber::fmt().json().with_env_filter(env_filter).init();

    let control_dir = std::env::var("FLEETLIFT_CONTROL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/workspace/.fleetlift"));

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let pr_creator = GhPullRequestCreator;
    fleetlift::agent::run(&control_dir, &pr_creator, shutdown).await;
}
