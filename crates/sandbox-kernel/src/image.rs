//! Image Provisioner: ensures the sandbox base image exists before a
//! container is created from it, rebuilding only when the Dockerfile the
//! image is built from has actually changed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::ContainerRuntime;

/// Build-tracking metadata persisted next to the Dockerfile so repeated
/// provisioning calls can tell whether a rebuild is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildInfo {
    dockerfile_hash: String,
    image_name: String,
}

#[derive(Debug, Clone)]
pub struct ImageProvisionerConfig {
    pub image_name: String,
    pub dockerfile_path: PathBuf,
    pub build_info_path: PathBuf,
    pub check_dockerfile_changes: bool,
}

/// Guarantees `self.image_name` is present and (optionally) up to date with
/// the on-disk Dockerfile before any sandbox tries to use it.
pub struct ImageProvisioner<R: ContainerRuntime> {
    runtime: std::sync::Arc<R>,
    config: ImageProvisionerConfig,
}

impl<R: ContainerRuntime> ImageProvisioner<R> {
    pub fn new(runtime: std::sync::Arc<R>, config: ImageProvisionerConfig) -> Self {
        Self { runtime, config }
    }

    /// Ensures the configured image is present, pulling it as a fallback
    /// when no local Dockerfile is available to build from.
    pub async fn ensure_ready(&self) -> Result<String> {
        let exists = self.runtime.image_exists(&self.config.image_name).await?;

        let needs_rebuild = if !exists {
            true
        } else if self.config.check_dockerfile_changes && self.config.dockerfile_path.exists() {
            self.dockerfile_changed().await?
        } else {
            false
        };

        if !needs_rebuild {
            info!(image = %self.config.image_name, "sandbox image already up to date");
            return Ok(self.config.image_name.clone());
        }

        if !self.config.dockerfile_path.exists() {
            warn!(
                image = %self.config.image_name,
                "no dockerfile on disk, falling back to a registry pull"
            );
            self.runtime.pull_image(&self.config.image_name).await?;
            return Ok(self.config.image_name.clone());
        }

        let context_dir = self
            .config
            .dockerfile_path
            .parent()
            .unwrap_or_else(|| Path::new("."));

        info!(image = %self.config.image_name, dockerfile = %self.config.dockerfile_path.display(), "rebuilding sandbox image");
        self.runtime
            .build_image(context_dir, &self.config.dockerfile_path, &self.config.image_name)
            .await
            .context("building sandbox image from Dockerfile")?;
        self.write_build_info().await?;
        Ok(self.config.image_name.clone())
    }

    async fn dockerfile_changed(&self) -> Result<bool> {
        let current_hash = hash_file(&self.config.dockerfile_path).await?;
        let previous = self.read_build_info().await;
        Ok(previous
            .map(|info| info.dockerfile_hash != current_hash)
            .unwrap_or(true))
    }

    async fn read_build_info(&self) -> Option<BuildInfo> {
        let contents = fs::read_to_string(&self.config.build_info_path).await.ok()?;
        serde_json::from_str(&contents).ok()
    }

    async fn write_build_info(&self) -> Result<()> {
        let hash = hash_file(&self.config.dockerfile_path).await?;
        let info = BuildInfo {
            dockerfile_hash: hash,
            image_name: self.config.image_name.clone(),
        };
        let serialized = serde_json::to_string(&info)?;
        if let Some(parent) = self.config.build_info_path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::write(&self.config.build_info_path, serialized)
            .await
            .with_context(|| format!("writing build info to {}", self.config.build_info_path.display()))
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Derives the deterministic container name used by the lifecycle manager:
/// `python-sandbox-<8 hex chars>`.
pub fn container_name(id: Uuid) -> String {
    let short = id.simple().to_string();
    format!("python-sandbox-{}", &short[..8])
}
