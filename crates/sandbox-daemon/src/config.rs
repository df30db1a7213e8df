//! Configuration Loader: reads `config.toml` if present, falls back to
//! built-in defaults with a warning, and lets environment variables
//! override individual keys — the same precedence order the service this
//! was ported from used (`APP_HOST`/`APP_PORT` over `config.toml`).

use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub docker: DockerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL used to synthesize file-download links returned from
    /// code execution, e.g. `http://localhost:8000`.
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            base_url: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://sandbox.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub default_image: String,
    pub dockerfile_path: PathBuf,
    pub build_info_file: PathBuf,
    pub check_dockerfile_changes: bool,
    /// Extra index URL passed to `uv pip install` as `--index-url`, for
    /// private package mirrors. Unset uses `uv`'s own default.
    pub pip_index_url: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            default_image: "python-sandbox:latest".to_string(),
            dockerfile_path: PathBuf::from("Dockerfile"),
            build_info_file: PathBuf::from(".docker_build_info"),
            check_dockerfile_changes: true,
            pip_index_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub require_auth: bool,
    #[serde(skip)]
    pub default_user_id: Uuid,
    pub jwt_secret: String,
    pub jwt_ttl_seconds: i64,
    pub append_api_key_to_file_links: bool,
    pub user_sandbox_limit: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            default_user_id: Uuid::nil(),
            jwt_secret: "change-me-in-production".to_string(),
            jwt_ttl_seconds: 300 * 60,
            append_api_key_to_file_links: false,
            user_sandbox_limit: sandbox_kernel::DEFAULT_USER_SANDBOX_LIMIT,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            docker: DockerConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `config.toml` from the working directory, falling back to
    /// defaults (with a warning) if it is missing or malformed, then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self> {
        let path = PathBuf::from("config.toml");
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "could not load configuration file, using defaults");
                AppConfig::default()
            }
        };

        if let Ok(host) = env::var("APP_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("APP_PORT") {
            config.server.port = port.parse().context("invalid APP_PORT")?;
        }
        if let Ok(base_url) = env::var("APP_BASE_URL") {
            config.server.base_url = base_url;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(secret) = env::var("SANDBOX_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Ok(value) = env::var("SANDBOX_REQUIRE_AUTH") {
            config.auth.require_auth = parse_bool(&value).unwrap_or(config.auth.require_auth);
        }
        if let Ok(value) = env::var("SANDBOX_USER_LIMIT") {
            config.auth.user_sandbox_limit = value.parse().context("invalid SANDBOX_USER_LIMIT")?;
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .context("invalid server.host/server.port combination")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
