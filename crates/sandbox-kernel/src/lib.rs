//! Sandbox kernel: the orchestration core between the HTTP/tool surface and
//! the Docker Engine. Wires together the container runtime adapter, image
//! provisioner, sandbox lifecycle manager, execution engine and package
//! install coordinator behind a single [`SandboxKernel`] handle.

pub mod exec;
pub mod image;
pub mod install;
pub mod lifecycle;
pub mod runtime;
pub mod transfer;

use std::sync::Arc;

use sandbox_db::Database;

pub use exec::{ExecutionEngine, ExecutionError, ExecutionOutcome, TouchedFile};
pub use image::{container_name, ImageProvisioner, ImageProvisionerConfig};
pub use install::{InstallCoordinator, InstalledPackage, InstallOutcome, InstallStatus};
pub use lifecycle::{LifecycleError, LifecycleManager, DEFAULT_USER_SANDBOX_LIMIT};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntimeAdapter, ExecResult};

/// Top-level facade the daemon depends on: a sandbox-aware handle bundling
/// the lifecycle manager, execution engine and install coordinator for a
/// single [`ContainerRuntime`] implementation.
pub struct SandboxKernel<R: ContainerRuntime> {
    pub lifecycle: LifecycleManager<R>,
    pub execution: ExecutionEngine<R>,
    pub install: InstallCoordinator<R>,
}

impl<R: ContainerRuntime> SandboxKernel<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        runtime: Arc<R>,
        image_provisioner: Arc<ImageProvisioner<R>>,
        user_sandbox_limit: u32,
        base_url: String,
        append_api_key_to_file_links: bool,
        pip_index_url: Option<String>,
    ) -> Self {
        Self {
            lifecycle: LifecycleManager::new(db.clone(), runtime.clone(), image_provisioner, user_sandbox_limit),
            execution: ExecutionEngine::new(runtime.clone(), db, base_url, append_api_key_to_file_links),
            install: InstallCoordinator::new(runtime, pip_index_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, ContainerStatus, ExecResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use uuid::Uuid;

    /// In-memory runtime double standing in for a real Docker engine so the
    /// lifecycle/execution/install wiring can be exercised without one.
    struct FakeRuntime {
        containers: Mutex<HashMap<String, String>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                containers: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
            let id = format!("container-{}", Uuid::new_v4());
            self.containers.lock().insert(id.clone(), spec.name.clone());
            Ok(id)
        }
        async fn start_container(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
            self.containers.lock().remove(id);
            Ok(())
        }
        async fn exists(&self, container_id: &str) -> anyhow::Result<bool> {
            Ok(self.containers.lock().contains_key(container_id))
        }
        async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<String>> {
            Ok(self
                .containers
                .lock()
                .iter()
                .find(|(_, n)| n.as_str() == name)
                .map(|(id, _)| id.clone()))
        }
        async fn container_status(&self, container_id: &str) -> anyhow::Result<ContainerStatus> {
            if self.containers.lock().contains_key(container_id) {
                Ok(ContainerStatus::Running)
            } else {
                Ok(ContainerStatus::Missing)
            }
        }
        async fn tail_logs(&self, _container_id: &str, _tail_lines: usize) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn exec(&self, _container_id: &str, command: Vec<String>) -> anyhow::Result<ExecResult> {
            Ok(ExecResult {
                stdout: command.join(" "),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
        async fn image_exists(&self, _image: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn pull_image(&self, _image: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn build_image(&self, _context_dir: &Path, _dockerfile: &Path, _tag: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn put_file(&self, _container_id: &str, _remote_path: &str, _contents: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_file(&self, _container_id: &str, _remote_path: &str) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    async fn kernel() -> (SandboxKernel<FakeRuntime>, Database) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = Arc::new(ImageProvisioner::new(
            runtime.clone(),
            ImageProvisionerConfig {
                image_name: "python-sandbox-base".into(),
                dockerfile_path: "/nonexistent/Dockerfile".into(),
                build_info_path: "/tmp/.sandbox_build_info_test".into(),
                check_dockerfile_changes: false,
            },
        ));
        let kernel = SandboxKernel::new(
            db.clone(),
            runtime,
            provisioner,
            DEFAULT_USER_SANDBOX_LIMIT,
            "http://localhost:8080".to_string(),
            false,
            None,
        );
        (kernel, db)
    }

    #[tokio::test]
    async fn create_resolve_and_delete_sandbox() {
        let (kernel, db) = kernel().await;
        let user = db
            .create_user(sandbox_db::NewUser {
                username: "dana",
                email: "dana@example.com",
                hashed_password: "hash",
                api_key: &"e".repeat(32),
            })
            .await
            .unwrap();

        let record = kernel.lifecycle.create_sandbox(user.id, "Sandbox 1").await.unwrap();
        let resolved = kernel.lifecycle.resolve_owned(user.id, record.id).await.unwrap();
        assert_eq!(resolved.id, record.id);

        let other_user = Uuid::new_v4();
        assert!(kernel.lifecycle.resolve_owned(other_user, record.id).await.is_err());

        kernel.lifecycle.delete_sandbox(&record).await.unwrap();
        assert!(kernel.lifecycle.resolve_owned(user.id, record.id).await.is_err());
    }

    #[tokio::test]
    async fn quota_blocks_fourth_sandbox() {
        let (kernel, db) = kernel().await;
        let user = db
            .create_user(sandbox_db::NewUser {
                username: "erin",
                email: "erin@example.com",
                hashed_password: "hash",
                api_key: &"f".repeat(32),
            })
            .await
            .unwrap();

        for i in 0..DEFAULT_USER_SANDBOX_LIMIT {
            kernel
                .lifecycle
                .create_sandbox(user.id, &format!("Sandbox {i}"))
                .await
                .unwrap();
        }

        let err = kernel.lifecycle.create_sandbox(user.id, "Sandbox overflow").await;
        assert!(matches!(err, Err(LifecycleError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn execution_runs_and_records_audit() {
        let (kernel, db) = kernel().await;
        let user = db
            .create_user(sandbox_db::NewUser {
                username: "frank",
                email: "frank@example.com",
                hashed_password: "hash",
                api_key: &"g".repeat(32),
            })
            .await
            .unwrap();
        let record = kernel.lifecycle.create_sandbox(user.id, "Sandbox 1").await.unwrap();

        let outcome = kernel
            .execution
            .run_code(record.id, &record.container_id, "print('hi')")
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));

        let executions = db.list_executions(record.id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
    }
}
