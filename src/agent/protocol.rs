//! Sandbox control-file protocol (§6.1): the four JSON documents
//! exchanged between the worker and the in-sandbox agent under a base
//! directory (`/workspace/.fleetlift/` by default).
//!
//! Every write goes through a temp-file-then-rename so a concurrent
//! reader never observes a torn document (§8 testable property 2); a
//! steering instruction is claimed by renaming it to a `.processing`
//! sibling before it is read and removed, so two concurrent pollers can
//! never both act on the same instruction (§8 testable property 3).

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::domain::error::{FleetliftError, ProtocolError};

/// Paths to the four control files within one sandbox's control
/// directory.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    pub manifest: PathBuf,
    pub status: PathBuf,
    pub result: PathBuf,
    pub steering: PathBuf,
}

impl ControlPaths {
    pub fn new(control_dir: impl AsRef<Path>) -> Self {
        let dir = control_dir.as_ref();
        Self {
            manifest: dir.join("manifest.json"),
            status: dir.join("status.json"),
            result: dir.join("result.json"),
            steering: dir.join("steering.json"),
        }
    }
}

/// Write `value` atomically to `path`: serialize, write to a sibling
/// `.tmp` file, then rename over the destination. The rename is atomic
/// on the same filesystem, so a reader polling `path` either sees the
/// previous complete document or the new one, never a partial write.
pub async fn write_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), FleetliftError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| {
        ProtocolError::Malformed {
            kind: "outgoing",
            reason: e.to_string(),
        }
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ProtocolError::Malformed {
                kind: "control-dir",
                reason: e.to_string(),
            }
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await.map_err(|e| ProtocolError::Malformed {
        kind: "temp-write",
        reason: e.to_string(),
    })?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| ProtocolError::Malformed {
        kind: "rename",
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Read and parse `path` if it exists, returning `None` if it does not
/// (a normal "not written yet" state for a poller, not an error).
pub async fn read_if_present<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FleetliftError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| ProtocolError::Malformed {
                kind: "incoming",
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProtocolError::Vanished(format!("{}: {e}", path.display())).into()),
    }
}

/// Poll `path` every `interval` until a document appears, honoring a
/// cooperative shutdown signal. Used for the manifest-poll loop
/// (§4.4 step 1) and the steering-poll loop (§4.5).
pub async fn poll_until_present<T: DeserializeOwned>(
    path: &Path,
    interval: std::time::Duration,
    shutdown: &crate::agent::shutdown::Shutdown,
) -> Option<T> {
    loop {
        if let Ok(Some(value)) = read_if_present(path).await {
            return Some(value);
        }
        if shutdown.wait(interval).await {
            return None;
        }
    }
}

/// Atomically claim a steering instruction by renaming `steering.json`
/// to `steering.json.processing`. On success the caller holds exclusive
/// ownership of the claimed file: no other poller can rename the same
/// source path out from under it, so exactly one instruction is ever
/// delivered per write (§8 testable property 3). Returns `None` if no
/// instruction is currently pending.
pub async fn claim_steering<T: DeserializeOwned>(steering_path: &Path) -> Result<Option<T>, FleetliftError> {
    let processing_path = steering_path.with_extension("json.processing");
    match tokio::fs::rename(steering_path, &processing_path).await {
        Ok(()) => {
            let bytes = tokio::fs::read(&processing_path).await.map_err(|e| ProtocolError::Malformed {
                kind: "steering",
                reason: e.to_string(),
            })?;
            let value = serde_json::from_slice(&bytes).map_err(|e| ProtocolError::Malformed {
                kind: "steering",
                reason: e.to_string(),
            })?;
            let _ = tokio::fs::remove_file(&processing_path).await;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProtocolError::Malformed {
            kind: "steering-claim",
            reason: e.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        n: u32,
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        write_atomic(&path, &Doc { n: 7 }).await.unwrap();
        let read: Option<Doc> = read_if_present(&path).await.unwrap();
        assert_eq!(read, Some(Doc { n: 7 }));
    }

    #[tokio::test]
    async fn read_missing_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.json");
        let read: Option<Doc> = read_if_present(&path).await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn repeated_writes_never_leave_a_torn_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        for n in 0..20 {
            write_atomic(&path, &Doc { n }).await.unwrap();
            let read: Option<Doc> = read_if_present(&path).await.unwrap();
            assert!(read.is_some());
        }
    }

    #[tokio::test]
    async fn claim_steering_is_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("steering.json");
        write_atomic(&path, &Doc { n: 1 }).await.unwrap();

        let first: Option<Doc> = claim_steering(&path).await.unwrap();
        let second: Option<Doc> = claim_steering(&path).await.unwrap();

        assert_eq!(first, Some(Doc { n: 1 }));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn concurrent_claims_deliver_exactly_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("steering.json");
        write_atomic(&path, &Doc { n: 42 }).await.unwrap();

        let path_a = path.clone();
        let path_b = path.clone();
        let (a, b): (Option<Doc>, Option<Doc>) = tokio::join!(
            async move { claim_steering(&path_a).await.unwrap() },
            async move { claim_steering(&path_b).await.unwrap() },
        );

        let delivered = [a, b].into_iter().flatten().count();
        assert_eq!(delivered, 1);
    }
}
