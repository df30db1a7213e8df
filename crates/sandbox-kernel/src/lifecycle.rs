//! Sandbox Lifecycle Manager: owns the mapping between the opaque
//! `sandbox_id` handed out to callers and the private container backing it,
//! and enforces per-user ownership and quota on every named operation.

use std::sync::Arc;

use sandbox_db::{Database, NewSandbox, SandboxRecord, UserError};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    image::{container_name, ImageProvisioner},
    runtime::{ContainerRuntime, ContainerSpec, ContainerStatus},
};

/// Number of trailing log lines captured for diagnostics when a sandbox is
/// found `exited` before being restarted.
const EXITED_LOG_TAIL_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("sandbox {0} is not owned by the requesting user")]
    NotOwned(Uuid),
    #[error("user has reached the maximum limit of {0} sandboxes")]
    QuotaExceeded(u32),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error(transparent)]
    Runtime(anyhow::Error),
}

/// Default cap on sandboxes a single user may hold concurrently, overridden
/// by the daemon's configuration layer.
pub const DEFAULT_USER_SANDBOX_LIMIT: u32 = 3;

pub struct LifecycleManager<R: ContainerRuntime> {
    db: Database,
    runtime: Arc<R>,
    image_provisioner: Arc<ImageProvisioner<R>>,
    user_sandbox_limit: u32,
}

impl<R: ContainerRuntime> LifecycleManager<R> {
    pub fn new(
        db: Database,
        runtime: Arc<R>,
        image_provisioner: Arc<ImageProvisioner<R>>,
        user_sandbox_limit: u32,
    ) -> Self {
        Self {
            db,
            runtime,
            image_provisioner,
            user_sandbox_limit,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Creates a new sandbox container for `user_id`, enforcing the quota
    /// before touching the container runtime.
    #[instrument(skip(self))]
    pub async fn create_sandbox(&self, user_id: Uuid, name: &str) -> Result<SandboxRecord, LifecycleError> {
        let current = self.db.count_by_user(user_id).await?;
        if current >= self.user_sandbox_limit {
            return Err(LifecycleError::QuotaExceeded(self.user_sandbox_limit));
        }

        let image = self
            .image_provisioner
            .ensure_ready()
            .await
            .map_err(LifecycleError::Runtime)?;

        let id = Uuid::new_v4();
        let container_name = container_name(id);
        let spec = ContainerSpec {
            name: container_name.clone(),
            image,
        };

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(LifecycleError::Runtime)?;
        self.runtime
            .start_container(&container_id)
            .await
            .map_err(LifecycleError::Runtime)?;

        let record = self
            .db
            .create_sandbox(NewSandbox {
                user_id,
                name,
                container_id: &container_id,
            })
            .await?;

        info!(sandbox_id = %record.id, user_id = %user_id, "sandbox created");
        Ok(record)
    }

    /// Resolves a sandbox owned by `user_id`, returning its record only
    /// after confirming ownership.
    pub async fn resolve_owned(&self, user_id: Uuid, sandbox_id: Uuid) -> Result<SandboxRecord, LifecycleError> {
        let record = self
            .db
            .fetch_sandbox(sandbox_id)
            .await?
            .ok_or(LifecycleError::NotFound(sandbox_id))?;
        if record.user_id != user_id {
            return Err(LifecycleError::NotOwned(sandbox_id));
        }
        Ok(record)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<SandboxRecord>, LifecycleError> {
        Ok(self.db.list_by_user(user_id).await?)
    }

    /// Resolves the live, running container id for a sandbox: preferring a
    /// strict id match and falling back to an exact container-name match
    /// under the sandbox label (never a substring match), then lazily
    /// restarting the container if it is found `exited`.
    #[instrument(skip(self))]
    pub async fn resolve_running(&self, record: &SandboxRecord) -> Result<String, LifecycleError> {
        let container_id = if self
            .runtime
            .exists(&record.container_id)
            .await
            .map_err(LifecycleError::Runtime)?
        {
            record.container_id.clone()
        } else {
            let expected_name = container_name(record.id);
            match self
                .runtime
                .find_by_name(&expected_name)
                .await
                .map_err(LifecycleError::Runtime)?
            {
                Some(id) => {
                    warn!(sandbox_id = %record.id, "recovered container by exact name after id lookup miss");
                    id
                }
                None => {
                    return Err(LifecycleError::Runtime(anyhow::anyhow!(
                        "no running container found for sandbox {}",
                        record.id
                    )))
                }
            }
        };

        let status = self
            .runtime
            .container_status(&container_id)
            .await
            .map_err(LifecycleError::Runtime)?;

        if status != ContainerStatus::Running {
            info!(sandbox_id = %record.id, ?status, "sandbox container is not running");

            if status == ContainerStatus::Exited {
                match self.runtime.tail_logs(&container_id, EXITED_LOG_TAIL_LINES).await {
                    Ok(logs) => warn!(sandbox_id = %record.id, %logs, "exited sandbox container logs"),
                    Err(err) => warn!(sandbox_id = %record.id, error = %err, "failed to read exited container logs"),
                }
            }

            info!(sandbox_id = %record.id, "restarting sandbox container");
            self.runtime
                .start_container(&container_id)
                .await
                .map_err(LifecycleError::Runtime)?;
        }

        Ok(container_id)
    }

    /// Stops and removes the backing container, then deletes the sandbox
    /// record. Ownership must already have been checked by the caller via
    /// [`resolve_owned`].
    #[instrument(skip(self, record))]
    pub async fn delete_sandbox(&self, record: &SandboxRecord) -> Result<(), LifecycleError> {
        let live_container = if self.runtime.exists(&record.container_id).await.unwrap_or(false) {
            Some(record.container_id.clone())
        } else {
            self.runtime
                .find_by_name(&container_name(record.id))
                .await
                .unwrap_or(None)
        };

        match live_container {
            Some(container_id) => {
                let _ = self.runtime.stop_container(&container_id).await;
                if let Err(err) = self.runtime.remove_container(&container_id).await {
                    warn!(sandbox_id = %record.id, error = %err, "failed to remove container during delete, removing record anyway");
                }
            }
            None => {
                warn!(sandbox_id = %record.id, "no live container found during delete, removing record anyway");
            }
        }

        self.db.delete_sandbox(record.id).await?;
        info!(sandbox_id = %record.id, "sandbox deleted");
        Ok(())
    }
}

impl From<UserError> for LifecycleError {
    fn from(value: UserError) -> Self {
        LifecycleError::Storage(value.into())
    }
}
