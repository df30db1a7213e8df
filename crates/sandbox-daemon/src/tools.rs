//! Tool Dispatch Layer: exposes the sandbox kernel as a small set of named
//! tools, callable either natively (via [`ToolDispatcher::call`]) or through
//! the `/messages/` HTTP leg fronted by `/sse`.
//!
//! Wiring a persistent per-client SSE session and a real `/messages/` push
//! channel is out of scope here; [`ToolTransport`]'s production body is a
//! placeholder event source that just announces where tool calls should be
//! POSTed. A real MCP transport crate would replace it without touching
//! [`ToolDispatcher`], since every call site — native and HTTP — already
//! goes through the same dispatcher.

use std::sync::Arc;

use sandbox_db::SandboxRecord;
use sandbox_kernel::{exec::ExecutionError, lifecycle::LifecycleError, ExecutionOutcome, InstallOutcome, InstallStatus};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::server::AppState;

/// Announces the endpoint tool callers should POST to. Kept as a trait so a
/// real SSE/MCP transport can be swapped in without changing
/// [`ToolDispatcher`] or its call sites.
pub trait ToolTransport: Send + Sync {
    fn endpoint_path(&self) -> &str;
}

pub struct SseToolTransport {
    messages_path: String,
}

impl SseToolTransport {
    pub fn new(messages_path: impl Into<String>) -> Self {
        Self {
            messages_path: messages_path.into(),
        }
    }
}

impl ToolTransport for SseToolTransport {
    fn endpoint_path(&self) -> &str {
        &self.messages_path
    }
}

/// Dispatches a named tool call against the sandbox kernel on behalf of
/// `user`. Every tool except `list_sandboxes` and `create_sandbox` checks
/// ownership of the referenced sandbox first and answers `Access denied.`
/// on failure, rather than distinguishing "not found" from "not yours".
pub struct ToolDispatcher {
    state: Arc<AppState>,
}

const ACCESS_DENIED: &str = "Access denied.";

impl ToolDispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn call(&self, user: &AuthenticatedUser, name: &str, arguments: &Value) -> Value {
        match name {
            "list_sandboxes" => self.list_sandboxes(user).await,
            "create_sandbox" => self.create_sandbox(user, arguments).await,
            "install_package_in_sandbox" => self.install_package_in_sandbox(user, arguments).await,
            "check_package_installation_status" => self.check_package_installation_status(user, arguments).await,
            "execute_python_code" => self.execute_python_code(user, arguments).await,
            "execute_terminal_command" => self.execute_terminal_command(user, arguments).await,
            "upload_file_to_sandbox" => self.upload_file_to_sandbox(user, arguments).await,
            other => json!({"error": format!("unknown tool: {other}")}),
        }
    }

    async fn list_sandboxes(&self, user: &AuthenticatedUser) -> Value {
        let records = match self.state.kernel.lifecycle.list_for_user(user.id).await {
            Ok(records) => records,
            Err(err) => return json!({"error": err.to_string()}),
        };

        let mut sandboxes = Vec::with_capacity(records.len());
        for record in records {
            let installed_packages = self
                .state
                .kernel
                .install
                .list_installed(record.id, &record.container_id)
                .await
                .into_iter()
                .map(|pkg| pkg.name)
                .collect::<Vec<_>>();
            sandboxes.push(json!({
                "id": record.id,
                "name": record.name,
                "created_at": record.created_at.to_rfc3339(),
                "installed_packages": installed_packages,
            }));
        }
        json!({"sandboxes": sandboxes})
    }

    async fn create_sandbox(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let existing = match self.state.kernel.lifecycle.list_for_user(user.id).await {
            Ok(existing) => existing,
            Err(err) => return json!({"error": err.to_string()}),
        };
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Sandbox {}", existing.len() + 1));

        match self.state.kernel.lifecycle.create_sandbox(user.id, &name).await {
            Ok(record) => json!({
                "id": record.id,
                "name": record.name,
                "created_at": record.created_at.to_rfc3339(),
            }),
            Err(err) => json!({"error": err.to_string()}),
        }
    }

    /// Resolves `arguments.sandbox_id` and checks ownership, collapsing both
    /// "not found" and "owned by someone else" into the same denial so a
    /// caller can't probe for the existence of sandboxes they don't own.
    async fn owned_sandbox(&self, user: &AuthenticatedUser, arguments: &Value) -> Result<SandboxRecord, Value> {
        let sandbox_id = arguments
            .get("sandbox_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| json!({"error": "sandbox_id is required"}))?;

        match self.state.kernel.lifecycle.resolve_owned(user.id, sandbox_id).await {
            Ok(record) => Ok(record),
            Err(LifecycleError::NotFound(_)) | Err(LifecycleError::NotOwned(_)) => Err(json!({"error": ACCESS_DENIED})),
            Err(err) => Err(json!({"error": err.to_string()})),
        }
    }

    async fn install_package_in_sandbox(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let record = match self.owned_sandbox(user, arguments).await {
            Ok(record) => record,
            Err(denial) => return denial,
        };
        let Some(package) = arguments.get("package").and_then(Value::as_str) else {
            return json!({"error": "package is required"});
        };
        let container_id = match self.state.kernel.lifecycle.resolve_running(&record).await {
            Ok(id) => id,
            Err(err) => return json!({"error": err.to_string()}),
        };
        let outcome = self
            .state
            .kernel
            .install
            .ensure_installed(record.id, &container_id, package)
            .await;
        install_outcome_json(&outcome)
    }

    async fn check_package_installation_status(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let record = match self.owned_sandbox(user, arguments).await {
            Ok(record) => record,
            Err(denial) => return denial,
        };
        let Some(package) = arguments.get("package").and_then(Value::as_str) else {
            return json!({"error": "package is required"});
        };
        let container_id = match self.state.kernel.lifecycle.resolve_running(&record).await {
            Ok(id) => id,
            Err(err) => return json!({"error": err.to_string()}),
        };
        let outcome = self
            .state
            .kernel
            .install
            .check_status(record.id, &container_id, package)
            .await;
        install_outcome_json(&outcome)
    }

    async fn execute_python_code(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let record = match self.owned_sandbox(user, arguments).await {
            Ok(record) => record,
            Err(denial) => return denial,
        };
        let Some(code) = arguments.get("code").and_then(Value::as_str) else {
            return json!({"error": "code is required"});
        };
        let container_id = match self.state.kernel.lifecycle.resolve_running(&record).await {
            Ok(id) => id,
            Err(err) => return json!({"error": err.to_string()}),
        };
        match self.state.kernel.execution.run_code(record.id, &container_id, code).await {
            Ok(outcome) => execution_outcome_json(&outcome),
            Err(err) => execution_error_json(err),
        }
    }

    async fn execute_terminal_command(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let record = match self.owned_sandbox(user, arguments).await {
            Ok(record) => record,
            Err(denial) => return denial,
        };
        let Some(command) = arguments.get("command").and_then(Value::as_str) else {
            return json!({"error": "command is required"});
        };
        let container_id = match self.state.kernel.lifecycle.resolve_running(&record).await {
            Ok(id) => id,
            Err(err) => return json!({"error": err.to_string()}),
        };
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        match self.state.kernel.execution.run_command(record.id, &container_id, argv).await {
            Ok(outcome) => json!({
                "stdout": outcome.stdout,
                "stderr": outcome.stderr,
                "exit_code": outcome.exit_code,
            }),
            Err(err) => json!({
                "stdout": "",
                "stderr": err.to_string(),
                "exit_code": -1,
            }),
        }
    }

    async fn upload_file_to_sandbox(&self, user: &AuthenticatedUser, arguments: &Value) -> Value {
        let record = match self.owned_sandbox(user, arguments).await {
            Ok(record) => record,
            Err(denial) => return denial,
        };
        let (Some(path), Some(content_base64)) = (
            arguments.get("path").and_then(Value::as_str),
            arguments.get("content_base64").and_then(Value::as_str),
        ) else {
            return json!({"error": "path and content_base64 are required"});
        };
        let contents = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, content_base64) {
            Ok(contents) => contents,
            Err(_) => return json!({"error": "content_base64 is not valid base64"}),
        };
        let container_id = match self.state.kernel.lifecycle.resolve_running(&record).await {
            Ok(id) => id,
            Err(err) => return json!({"error": err.to_string()}),
        };
        match self
            .state
            .kernel
            .lifecycle
            .runtime()
            .put_file(&container_id, path, &contents)
            .await
        {
            Ok(()) => json!({"status": "uploaded"}),
            Err(err) => json!({"error": err.to_string()}),
        }
    }
}

fn install_outcome_json(outcome: &InstallOutcome) -> Value {
    json!({
        "status": match outcome.status {
            InstallStatus::Installing => "installing",
            InstallStatus::Installed => "installed",
            InstallStatus::Failed => "failed",
        },
        "detail": outcome.detail,
        "already_installed": outcome.already_installed,
    })
}

fn execution_outcome_json(outcome: &ExecutionOutcome) -> Value {
    json!({
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "exit_code": outcome.exit_code,
        "files": outcome.touched_files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
        "file_links": outcome.file_links,
    })
}

fn execution_error_json(err: ExecutionError) -> Value {
    match err {
        ExecutionError::PrepareFailed { stdout, stderr, exit_code } => json!({
            "error": "Could not write code into container",
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
            "files": [],
            "file_links": [],
        }),
        ExecutionError::Runtime(err) => json!({
            "error": err.to_string(),
            "exit_code": 1,
            "stdout": "",
            "stderr": err.to_string(),
            "files": [],
            "file_links": [],
        }),
    }
}
