//! Execution Engine: serializes code/command execution per sandbox and
//! watermarks `/app/results` by ctime so callers can retrieve only the
//! files an execution actually produced or touched.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use sandbox_db::{Database, ExecutionKind, NewExecution};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::runtime::{ContainerRuntime, ExecResult};

const RESULTS_DIR: &str = "/app/results";
const CODE_FILE: &str = "/tmp/code_to_run.py";
const HEREDOC_SENTINEL: &str = "EOL";

/// A file under `/app/results` whose ctime is at or after the execution's
/// start watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedFile {
    pub path: String,
    pub ctime: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub touched_files: Vec<TouchedFile>,
    pub file_links: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The here-doc write of the user's source into [`CODE_FILE`] exited
    /// non-zero; `exit_code` is the shell's own exit status, not the user
    /// program's.
    #[error("could not write code into container")]
    PrepareFailed {
        stdout: String,
        stderr: String,
        exit_code: Option<i64>,
    },
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Builds the here-doc shell command that writes `source` into
/// [`CODE_FILE`] inside the container, using a fixed sentinel so the
/// write is a single exec rather than a multi-step copy.
fn write_code_command(source: &str) -> Vec<String> {
    let script = format!("cat > {CODE_FILE} << '{HEREDOC_SENTINEL}'\n{source}\n{HEREDOC_SENTINEL}");
    vec!["sh".to_string(), "-c".to_string(), script]
}

pub struct ExecutionEngine<R: ContainerRuntime> {
    runtime: Arc<R>,
    db: Database,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    base_url: String,
    append_api_key_to_file_links: bool,
}

impl<R: ContainerRuntime> ExecutionEngine<R> {
    pub fn new(runtime: Arc<R>, db: Database, base_url: String, append_api_key_to_file_links: bool) -> Self {
        Self {
            runtime,
            db,
            locks: std::sync::Mutex::new(HashMap::new()),
            base_url,
            append_api_key_to_file_links,
        }
    }

    fn lock_for(&self, sandbox_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("execution lock table poisoned");
        locks
            .entry(sandbox_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs Python `source` inside the sandbox container: writes it to
    /// `/tmp/code_to_run.py` via a here-doc exec, runs it, then best-effort
    /// cleans up the temp file. Serialized against any other execution in
    /// the same sandbox so the fixed temp path never races.
    #[instrument(skip(self, source), fields(sandbox_id = %sandbox_id))]
    pub async fn run_code(
        &self,
        sandbox_id: Uuid,
        container_id: &str,
        source: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let start_ts = Utc::now();
        let started = std::time::Instant::now();

        let write = self
            .runtime
            .exec(container_id, write_code_command(source))
            .await?;
        if write.exit_code != Some(0) {
            self.persist_audit(sandbox_id, ExecutionKind::Code, None, start_ts, started.elapsed().as_millis() as u64)
                .await;
            return Err(ExecutionError::PrepareFailed {
                stdout: write.stdout,
                stderr: write.stderr,
                exit_code: write.exit_code,
            });
        }

        let command = vec!["python".to_string(), CODE_FILE.to_string()];
        let result = self.runtime.exec(container_id, command).await;

        let _ = self
            .runtime
            .exec(container_id, vec!["rm".to_string(), "-f".to_string(), CODE_FILE.to_string()])
            .await;

        let outcome = self
            .finish(sandbox_id, container_id, ExecutionKind::Code, result, start_ts, started)
            .await?;
        Ok(outcome)
    }

    /// Runs an arbitrary shell command inside the sandbox container,
    /// serialized against any other execution in the same sandbox.
    #[instrument(skip(self, command), fields(sandbox_id = %sandbox_id))]
    pub async fn run_command(
        &self,
        sandbox_id: Uuid,
        container_id: &str,
        command: Vec<String>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let start_ts = Utc::now();
        let started = std::time::Instant::now();
        let result = self.runtime.exec(container_id, command).await;
        self.finish(sandbox_id, container_id, ExecutionKind::Command, result, start_ts, started)
            .await
    }

    async fn finish(
        &self,
        sandbox_id: Uuid,
        container_id: &str,
        kind: ExecutionKind,
        result: anyhow::Result<ExecResult>,
        start_ts: chrono::DateTime<Utc>,
        started: std::time::Instant,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let outcome = match result {
            Ok(ExecResult { stdout, stderr, exit_code }) => {
                let touched = self
                    .list_touched_files(container_id, start_ts.timestamp())
                    .await
                    .unwrap_or_else(|err| {
                        warn!(sandbox_id = %sandbox_id, error = %err, "failed to watermark output files");
                        Vec::new()
                    });
                let file_links = self.file_links(sandbox_id, &touched).await;
                ExecutionOutcome {
                    stdout,
                    stderr,
                    exit_code,
                    touched_files: touched,
                    file_links,
                }
            }
            Err(err) => {
                self.persist_audit(sandbox_id, kind, None, start_ts, started.elapsed().as_millis() as u64)
                    .await;
                return Err(ExecutionError::Runtime(err));
            }
        };

        self.persist_audit(
            sandbox_id,
            kind,
            outcome.exit_code.map(|code| code as i32),
            start_ts,
            started.elapsed().as_millis() as u64,
        )
        .await;

        Ok(outcome)
    }

    /// Synthesizes download URLs for files the execution produced. The
    /// `api_key` query param is appended only when the sandbox's owning
    /// user has one on record and `auth.append_api_key_to_file_links` is
    /// enabled.
    async fn file_links(&self, sandbox_id: Uuid, touched: &[TouchedFile]) -> Vec<String> {
        if touched.is_empty() {
            return Vec::new();
        }

        let api_key = if self.append_api_key_to_file_links {
            self.owner_api_key(sandbox_id).await
        } else {
            None
        };

        touched
            .iter()
            .map(|file| match &api_key {
                Some(key) => format!(
                    "{}/sandbox/file?sandbox_id={}&file_path={}&api_key={}",
                    self.base_url, sandbox_id, file.path, key
                ),
                None => format!(
                    "{}/sandbox/file?sandbox_id={}&file_path={}",
                    self.base_url, sandbox_id, file.path
                ),
            })
            .collect()
    }

    async fn owner_api_key(&self, sandbox_id: Uuid) -> Option<String> {
        let sandbox = self.db.fetch_sandbox(sandbox_id).await.ok().flatten()?;
        let user = self.db.fetch_user(sandbox.user_id).await.ok().flatten()?;
        Some(user.api_key)
    }

    async fn persist_audit(
        &self,
        sandbox_id: Uuid,
        kind: ExecutionKind,
        exit_code: Option<i32>,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
    ) {
        let entry = NewExecution {
            sandbox_id,
            kind,
            exit_code,
            started_at,
            duration_ms,
        };
        if let Err(err) = self.db.record_execution(entry).await {
            warn!(sandbox_id = %sandbox_id, error = %err, "best-effort execution audit write failed");
        }
    }

    /// Lists files under `/app/results` whose ctime is >= `start_ts`,
    /// mirroring `stat -c "%n|%Z"` scoped to files the execution touched.
    async fn list_touched_files(&self, container_id: &str, start_ts: i64) -> anyhow::Result<Vec<TouchedFile>> {
        let command = vec![
            "find".to_string(),
            RESULTS_DIR.to_string(),
            "-type".to_string(),
            "f".to_string(),
            "-printf".to_string(),
            "%p|%C@\\n".to_string(),
        ];
        let result = self.runtime.exec(container_id, command).await?;
        if result.exit_code != Some(0) {
            return Ok(Vec::new());
        }

        let mut touched = Vec::new();
        for line in result.stdout.lines() {
            let Some((path, ctime_raw)) = line.rsplit_once('|') else { continue };
            let ctime = ctime_raw
                .split('.')
                .next()
                .unwrap_or(ctime_raw)
                .parse::<i64>()
                .unwrap_or_default();
            if ctime >= start_ts {
                touched.push(TouchedFile {
                    path: path.to_string(),
                    ctime,
                });
            }
        }
        Ok(touched)
    }
}
