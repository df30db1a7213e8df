//! Persistence layer for the sandbox service: users, sandbox records, and
//! execution audit entries.
//!
//! Offers an async API around `sqlx`'s `Any` driver so the identity store and
//! sandbox registry run unmodified against SQLite (single-node) or Postgres
//! (multi-node), with schema managed by embedded migrations.

pub mod audit;

use std::{str::FromStr, sync::Once};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, migrate::MigrateError, AnyPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// Supported database backends for the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    driver: DatabaseDriver,
}

impl Database {
    /// Establishes (or creates) a connection pool for the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = sqlx::any::AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let migration_result = match driver {
            DatabaseDriver::Sqlite => sqlx::migrate!("./migrations").run(&pool).await,
            DatabaseDriver::Postgres => sqlx::migrate!("./migrations_postgres").run(&pool).await,
        };
        if let Err(err) = migration_result {
            match &err {
                MigrateError::Execute(sqlx::Error::Database(db_err))
                    if db_err
                        .code()
                        .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                        .unwrap_or(false) => {}
                _ => return Err(err.into()),
            }
        }

        Ok(Self { pool, driver })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    // ---- users -----------------------------------------------------

    pub async fn create_user(&self, data: NewUser<'_>) -> Result<UserRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO users (id, username, email, hashed_password, api_key, is_active, created_at) \
                 VALUES (?, ?, ?, ?, ?, 1, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO users (id, username, email, hashed_password, api_key, is_active, created_at) \
                 VALUES ($1, $2, $3, $4, $5, TRUE, $6)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(data.username)
            .bind(data.email)
            .bind(data.hashed_password)
            .bind(data.api_key)
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    anyhow::Error::new(UserError::Conflict)
                } else {
                    err.into()
                }
            })?;

        self.fetch_user(id)
            .await?
            .ok_or_else(|| anyhow!("user inserted but missing when reloaded"))
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE id = ?",
            DatabaseDriver::Postgres => postgres_user_select("id = $1"),
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn fetch_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE username = ? COLLATE NOCASE",
            DatabaseDriver::Postgres => postgres_user_select("lower(username) = lower($1)"),
        };
        let row = sqlx::query(select)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn fetch_user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE api_key = ?",
            DatabaseDriver::Postgres => postgres_user_select("api_key = $1"),
        };
        let row = sqlx::query(select)
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    // ---- sandboxes ---------------------------------------------------

    pub async fn create_sandbox(&self, data: NewSandbox<'_>) -> Result<SandboxRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO sandboxes (id, user_id, name, created_at, docker_container_id) \
                 VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO sandboxes (id, user_id, name, created_at, docker_container_id) \
                 VALUES ($1, $2, $3, $4, $5)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(data.user_id))
            .bind(data.name)
            .bind(encode_datetime(now))
            .bind(data.container_id)
            .execute(&self.pool)
            .await?;

        self.fetch_sandbox(id)
            .await?
            .ok_or_else(|| anyhow!("sandbox inserted but missing when reloaded"))
    }

    pub async fn fetch_sandbox(&self, id: Uuid) -> Result<Option<SandboxRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM sandboxes WHERE id = ?",
            DatabaseDriver::Postgres => postgres_sandbox_select("id = $1"),
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_sandbox).transpose()
    }

    /// Lists all sandboxes owned by a user, oldest first (used to derive the
    /// auto-generated `Sandbox N` name and to present a stable listing order).
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<SandboxRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM sandboxes WHERE user_id = ? ORDER BY created_at ASC"
            }
            DatabaseDriver::Postgres => {
                postgres_sandbox_select_ordered("user_id = $1", "created_at ASC")
            }
        };
        let mut rows = sqlx::query(select).bind(encode_uuid(user_id)).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    pub async fn count_by_user(&self, user_id: Uuid) -> Result<u32> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT COUNT(*) AS n FROM sandboxes WHERE user_id = ?",
            DatabaseDriver::Postgres => "SELECT COUNT(*) AS n FROM sandboxes WHERE user_id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as u32)
    }

    pub async fn is_owner(&self, user_id: Uuid, sandbox_id: Uuid) -> Result<bool> {
        match self.fetch_sandbox(sandbox_id).await? {
            Some(record) => Ok(record.user_id == user_id),
            None => Ok(false),
        }
    }

    pub async fn delete_sandbox(&self, id: Uuid) -> Result<bool> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM sandboxes WHERE id = ?",
            DatabaseDriver::Postgres => "DELETE FROM sandboxes WHERE id = $1",
        };
        let result = sqlx::query(delete)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- execution audit ---------------------------------------------

    pub async fn record_execution(&self, entry: NewExecution) -> Result<()> {
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO sandbox_executions (id, sandbox_id, kind, exit_code, started_at, duration_ms) \
                 VALUES (?, ?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO sandbox_executions (id, sandbox_id, kind, exit_code, started_at, duration_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(Uuid::new_v4()))
            .bind(encode_uuid(entry.sandbox_id))
            .bind(entry.kind.as_str())
            .bind(entry.exit_code)
            .bind(encode_datetime(entry.started_at))
            .bind(entry.duration_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_executions(&self, sandbox_id: Uuid, limit: u32) -> Result<Vec<ExecutionRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM sandbox_executions WHERE sandbox_id = ? ORDER BY started_at DESC LIMIT ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT id::text AS id, sandbox_id::text AS sandbox_id, kind, exit_code, \
                 started_at::text AS started_at, duration_ms FROM sandbox_executions \
                 WHERE sandbox_id = $1 ORDER BY started_at DESC LIMIT $2"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_uuid(sandbox_id))
            .bind(limit as i64)
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_execution(row)?);
        }
        Ok(out)
    }
}

fn postgres_user_select(predicate: &'static str) -> String {
    format!(
        "SELECT id::text AS id, username, email, hashed_password, api_key, is_active, \
         created_at::text AS created_at FROM users WHERE {predicate}"
    )
}

fn postgres_sandbox_select(predicate: &'static str) -> String {
    postgres_sandbox_select_ordered(predicate, "created_at ASC")
}

fn postgres_sandbox_select_ordered(predicate: &'static str, order: &'static str) -> String {
    format!(
        "SELECT id::text AS id, user_id::text AS user_id, name, created_at::text AS created_at, \
         docker_container_id FROM sandboxes WHERE {predicate} ORDER BY {order}"
    )
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(code.as_ref(), "2067" | "1555" | "23505")
            } else {
                db_err.message().to_ascii_lowercase().contains("unique")
            }
        }
        _ => false,
    }
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn encode_uuid(value: Uuid) -> String {
    value.to_string()
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| anyhow!("invalid UUID '{}': {}", value, err))
}

fn decode_bool(row: &AnyRow, column: &str) -> Result<bool> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => {
            let raw: i64 = row.try_get(column)?;
            Ok(raw != 0)
        }
    }
}

fn map_user(row: AnyRow) -> Result<UserRecord> {
    let id = parse_uuid(row.try_get::<String, _>("id")?)?;
    Ok(UserRecord {
        id,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        hashed_password: row.try_get("hashed_password")?,
        api_key: row.try_get("api_key")?,
        is_active: decode_bool(&row, "is_active")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
    })
}

fn map_sandbox(row: AnyRow) -> Result<SandboxRecord> {
    let id = parse_uuid(row.try_get::<String, _>("id")?)?;
    let user_id = parse_uuid(row.try_get::<String, _>("user_id")?)?;
    Ok(SandboxRecord {
        id,
        user_id,
        name: row.try_get("name")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        container_id: row.try_get("docker_container_id")?,
    })
}

fn map_execution(row: AnyRow) -> Result<ExecutionRecord> {
    let id = parse_uuid(row.try_get::<String, _>("id")?)?;
    let sandbox_id = parse_uuid(row.try_get::<String, _>("sandbox_id")?)?;
    let kind: String = row.try_get("kind")?;
    Ok(ExecutionRecord {
        id,
        sandbox_id,
        kind: ExecutionKind::from_str(&kind)?,
        exit_code: row.try_get("exit_code")?,
        started_at: parse_datetime(row.try_get("started_at")?)?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
    })
}

/// Borrowed insert payload for a new user, avoiding an allocation per field
/// for the common case where the caller already owns the strings.
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub hashed_password: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub hashed_password: String,
    pub api_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

pub struct NewSandbox<'a> {
    pub user_id: Uuid,
    pub name: &'a str,
    pub container_id: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Backing container identifier. Never serialized past the service boundary.
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Code,
    Command,
}

impl ExecutionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Code => "code",
            ExecutionKind::Command => "command",
        }
    }
}

impl FromStr for ExecutionKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "code" => Ok(ExecutionKind::Code),
            "command" => Ok(ExecutionKind::Command),
            other => Err(anyhow!("unknown execution kind '{other}'")),
        }
    }
}

pub struct NewExecution {
    pub sandbox_id: Uuid,
    pub kind: ExecutionKind,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub sandbox_id: Uuid,
    pub kind: ExecutionKind,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Errors raised by the identity store that the daemon maps onto HTTP/tool responses.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("username or email already registered")]
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.expect("connect")
    }

    #[tokio::test]
    async fn create_and_fetch_user_roundtrip() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                username: "alice",
                email: "alice@example.com",
                hashed_password: "hash",
                api_key: "k".repeat(32).as_str(),
            })
            .await
            .expect("create user");

        let fetched = db.fetch_user(user.id).await.expect("fetch").expect("present");
        assert_eq!(fetched.username, "alice");
        assert!(fetched.is_active);
    }

    #[tokio::test]
    async fn duplicate_username_case_insensitive_conflicts() {
        let db = memory_db().await;
        db.create_user(NewUser {
            username: "Alice",
            email: "a1@example.com",
            hashed_password: "hash",
            api_key: &"a".repeat(32),
        })
        .await
        .expect("first create");

        let err = db
            .create_user(NewUser {
                username: "alice",
                email: "a2@example.com",
                hashed_password: "hash",
                api_key: &"b".repeat(32),
            })
            .await
            .expect_err("should conflict");

        assert!(err.downcast_ref::<UserError>().is_some());
    }

    #[tokio::test]
    async fn sandbox_crud_and_quota_count() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                username: "bob",
                email: "bob@example.com",
                hashed_password: "hash",
                api_key: &"c".repeat(32),
            })
            .await
            .expect("create user");

        let sandbox = db
            .create_sandbox(NewSandbox {
                user_id: user.id,
                name: "Sandbox 1",
                container_id: "container-abc",
            })
            .await
            .expect("create sandbox");

        assert_eq!(db.count_by_user(user.id).await.unwrap(), 1);
        assert!(db.is_owner(user.id, sandbox.id).await.unwrap());
        assert!(!db.is_owner(Uuid::new_v4(), sandbox.id).await.unwrap());

        let listed = db.list_by_user(user.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sandbox.id);

        assert!(db.delete_sandbox(sandbox.id).await.unwrap());
        assert_eq!(db.count_by_user(user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn execution_audit_roundtrip() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                username: "carol",
                email: "carol@example.com",
                hashed_password: "hash",
                api_key: &"d".repeat(32),
            })
            .await
            .unwrap();
        let sandbox = db
            .create_sandbox(NewSandbox {
                user_id: user.id,
                name: "Sandbox 1",
                container_id: "container-xyz",
            })
            .await
            .unwrap();

        db.record_execution(NewExecution {
            sandbox_id: sandbox.id,
            kind: ExecutionKind::Code,
            exit_code: Some(0),
            started_at: Utc::now(),
            duration_ms: 42,
        })
        .await
        .unwrap();

        let executions = db.list_executions(sandbox.id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].exit_code, Some(0));
        assert_eq!(executions[0].kind, ExecutionKind::Code);
    }
}
