//! Package Install Coordinator: deduplicates concurrent install requests for
//! the same `(sandbox_id, package)` pair so two callers racing to import the
//! same package don't both trigger a `uv pip install`, and exposes a
//! 5-second bounded-wait fast path so the common case (already cached, or
//! quick to fetch) doesn't force callers to poll `check_status` themselves.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::runtime::ContainerRuntime;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Installing,
    Installed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub status: InstallStatus,
    pub detail: Option<String>,
    pub already_installed: bool,
}

impl InstallOutcome {
    fn installing() -> Self {
        Self {
            status: InstallStatus::Installing,
            detail: None,
            already_installed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct InstallKey {
    sandbox_id: Uuid,
    package: String,
}

pub struct InstallCoordinator<R: ContainerRuntime> {
    runtime: Arc<R>,
    table: Arc<RwLock<HashMap<InstallKey, InstallOutcome>>>,
    index_url: Option<String>,
}

impl<R: ContainerRuntime> InstallCoordinator<R> {
    pub fn new(runtime: Arc<R>, index_url: Option<String>) -> Self {
        Self {
            runtime,
            table: Arc::new(RwLock::new(HashMap::new())),
            index_url,
        }
    }

    /// Kicks off (or joins) an install of `package` into the sandbox's
    /// container. The actual `uv pip install` runs in a detached background
    /// task so every caller — not just the one that loses the race — only
    /// ever blocks for the 5-second fast-path window before falling back to
    /// `{status: "installing"}` and telling the caller to poll
    /// [`Self::check_status`].
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, package = %package))]
    pub async fn ensure_installed(&self, sandbox_id: Uuid, container_id: &str, package: &str) -> InstallOutcome {
        let key = InstallKey {
            sandbox_id,
            package: package.to_string(),
        };

        let should_spawn = {
            let mut table = self.table.write();
            match table.get(&key) {
                Some(existing) if existing.status != InstallStatus::Failed => false,
                _ => {
                    table.insert(key.clone(), InstallOutcome::installing());
                    true
                }
            }
        };

        if should_spawn {
            let runtime = self.runtime.clone();
            let table = self.table.clone();
            let container_id = container_id.to_string();
            let package_name = package.to_string();
            let index_url = self.index_url.clone();
            let spawn_key = key.clone();
            tokio::spawn(async move {
                let outcome = run_install(&*runtime, &container_id, &package_name, index_url.as_deref()).await;
                table.write().insert(spawn_key, outcome);
            });
        }

        self.wait_for_completion(&key, MAX_WAIT).await.unwrap_or_else(InstallOutcome::installing)
    }

    /// Reports the current install status, falling back to a cheap
    /// `uv pip list | grep` probe when no install has ever been requested
    /// through this coordinator for the pair (e.g. after a daemon restart).
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, package = %package))]
    pub async fn check_status(&self, sandbox_id: Uuid, container_id: &str, package: &str) -> InstallOutcome {
        let key = InstallKey {
            sandbox_id,
            package: package.to_string(),
        };

        if let Some(outcome) = self.table.read().get(&key).cloned() {
            if outcome.status != InstallStatus::Installing {
                return outcome;
            }
            if let Some(settled) = self.wait_for_completion(&key, MAX_WAIT).await {
                return settled;
            }
            return InstallOutcome::installing();
        }

        self.probe_already_installed(container_id, package).await
    }

    /// Runs `uv pip list --format=json` and robustly extracts the first
    /// JSON array from the output, tolerating container startup banners or
    /// warnings the tool may print before it.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id))]
    pub async fn list_installed(&self, sandbox_id: Uuid, container_id: &str) -> Vec<InstalledPackage> {
        let command = vec![
            "uv".to_string(),
            "pip".to_string(),
            "list".to_string(),
            "--format=json".to_string(),
        ];
        let result = match self.runtime.exec(container_id, command).await {
            Ok(result) if result.exit_code == Some(0) => result,
            Ok(result) => {
                warn!(sandbox_id = %sandbox_id, exit_code = ?result.exit_code, "uv pip list exited non-zero");
                return Vec::new();
            }
            Err(err) => {
                warn!(sandbox_id = %sandbox_id, error = %err, "failed to run uv pip list");
                return Vec::new();
            }
        };

        extract_json_array(&result.stdout)
            .and_then(|array| serde_json::from_str(array).ok())
            .unwrap_or_default()
    }

    async fn probe_already_installed(&self, container_id: &str, package: &str) -> InstallOutcome {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("uv pip list | grep -i {package}"),
        ];
        match self.runtime.exec(container_id, command).await {
            Ok(result) if result.exit_code == Some(0) && !result.stdout.trim().is_empty() => InstallOutcome {
                status: InstallStatus::Installed,
                detail: None,
                already_installed: true,
            },
            _ => InstallOutcome {
                status: InstallStatus::Failed,
                detail: Some("not_found".to_string()),
                already_installed: false,
            },
        }
    }

    async fn wait_for_completion(&self, key: &InstallKey, timeout: Duration) -> Option<InstallOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.table.read().get(key).cloned() {
                if outcome.status != InstallStatus::Installing {
                    return Some(outcome);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

async fn run_install<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    container_id: &str,
    package: &str,
    index_url: Option<&str>,
) -> InstallOutcome {
    let mut command = vec!["uv".to_string(), "pip".to_string(), "install".to_string()];
    if let Some(index_url) = index_url {
        command.push("--index-url".to_string());
        command.push(index_url.to_string());
    }
    command.push(package.to_string());

    match runtime.exec(container_id, command).await {
        Ok(result) if result.exit_code == Some(0) => {
            info!(package, "package installed");
            InstallOutcome {
                status: InstallStatus::Installed,
                detail: None,
                already_installed: false,
            }
        }
        Ok(result) => InstallOutcome {
            status: InstallStatus::Failed,
            detail: Some(result.stderr),
            already_installed: false,
        },
        Err(err) => InstallOutcome {
            status: InstallStatus::Failed,
            detail: Some(err.to_string()),
            already_installed: false,
        },
    }
}

/// Scans for the first `[` and its matching `]`, skipping any banner text
/// `uv` printed before the JSON payload.
fn extract_json_array(output: &str) -> Option<&str> {
    let start = output.find('[')?;
    let mut depth = 0i32;
    for (offset, ch) in output[start..].char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&output[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, ContainerStatus, ExecResult};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRuntime {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn create_container(&self, _spec: &ContainerSpec) -> anyhow::Result<String> {
            unimplemented!()
        }
        async fn start_container(&self, _id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn stop_container(&self, _id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn remove_container(&self, _id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn exists(&self, _container_id: &str) -> anyhow::Result<bool> {
            unimplemented!()
        }
        async fn find_by_name(&self, _name: &str) -> anyhow::Result<Option<String>> {
            unimplemented!()
        }
        async fn container_status(&self, _container_id: &str) -> anyhow::Result<ContainerStatus> {
            unimplemented!()
        }
        async fn tail_logs(&self, _container_id: &str, _tail_lines: usize) -> anyhow::Result<String> {
            unimplemented!()
        }
        async fn exec(&self, _container_id: &str, _command: Vec<String>) -> anyhow::Result<ExecResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ExecResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
        async fn image_exists(&self, _image: &str) -> anyhow::Result<bool> {
            unimplemented!()
        }
        async fn pull_image(&self, _image: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn build_image(&self, _context_dir: &Path, _dockerfile: &Path, _tag: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn put_file(&self, _container_id: &str, _remote_path: &str, _contents: &[u8]) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_file(&self, _container_id: &str, _remote_path: &str) -> anyhow::Result<Vec<u8>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn concurrent_installs_of_same_package_run_once() {
        let runtime = Arc::new(CountingRuntime {
            calls: AtomicU32::new(0),
        });
        let coordinator = Arc::new(InstallCoordinator::new(runtime.clone(), None));
        let sandbox_id = Uuid::new_v4();

        let a = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_installed(sandbox_id, "c1", "numpy").await })
        };
        let b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_installed(sandbox_id, "c1", "numpy").await })
        };

        let (first, second) = tokio::join!(a, b);
        assert_eq!(first.unwrap().status, InstallStatus::Installed);
        assert_eq!(second.unwrap().status, InstallStatus::Installed);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extract_json_array_skips_leading_banner_text() {
        let output = "Using Python 3.11\n[{\"name\": \"numpy\", \"version\": \"1.2\"}]\n";
        let array = extract_json_array(output).unwrap();
        let packages: Vec<InstalledPackage> = serde_json::from_str(array).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "numpy");
    }
}
