//! Identity Store: user registration, login and API-key issuance.
//!
//! Passwords are hashed with `argon2` (a stronger default than the
//! `pbkdf2`/bcrypt lineage this daemon's sibling crates otherwise lean on)
//! and sessions are JWTs signed with HS256 via `jsonwebtoken`.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sandbox_db::{Database, NewUser, UserError, UserRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const API_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("username or email already registered")]
    Conflict,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account is disabled")]
    Inactive,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("failed to hash password")]
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: Uuid,
    pub exp: i64,
}

#[derive(Clone)]
pub struct IdentityStore {
    db: Database,
    jwt_secret: String,
    jwt_ttl_seconds: i64,
}

impl IdentityStore {
    pub fn new(db: Database, jwt_secret: String, jwt_ttl_seconds: i64) -> Self {
        Self {
            db,
            jwt_secret,
            jwt_ttl_seconds,
        }
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<UserRecord, IdentityError> {
        let hashed = hash_password(password)?;
        let api_key = generate_api_key();

        self.db
            .create_user(NewUser {
                username,
                email,
                hashed_password: &hashed,
                api_key: &api_key,
            })
            .await
            .map_err(|err| match err.downcast::<UserError>() {
                Ok(UserError::Conflict) => IdentityError::Conflict,
                Err(other) => IdentityError::Storage(other),
            })
    }

    /// Verifies a username/password pair and issues a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, IdentityError> {
        let user = self
            .db
            .fetch_user_by_username(username)
            .await?
            .ok_or(IdentityError::InvalidCredentials)?;

        if !user.is_active {
            return Err(IdentityError::Inactive);
        }

        if !verify_password(password, &user.hashed_password)? {
            return Err(IdentityError::InvalidCredentials);
        }

        self.issue_token(&user)
    }

    pub fn issue_token(&self, user: &UserRecord) -> Result<String, IdentityError> {
        let exp = (Utc::now() + ChronoDuration::seconds(self.jwt_ttl_seconds)).timestamp();
        let claims = Claims {
            sub: user.username.clone(),
            user_id: user.id,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|_| IdentityError::Hashing)
    }

    pub fn decode_token(&self, token: &str) -> Option<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .ok()
        .map(|data| data.claims)
    }

    pub async fn user_by_claims(&self, claims: &Claims) -> Result<Option<UserRecord>, IdentityError> {
        Ok(self.db.fetch_user(claims.user_id).await?)
    }

    pub async fn user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>, IdentityError> {
        Ok(self.db.fetch_user_by_api_key(api_key).await?)
    }
}

fn hash_password(password: &str) -> Result<String, IdentityError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| IdentityError::Hashing)
}

fn verify_password(password: &str, hashed: &str) -> Result<bool, IdentityError> {
    let parsed = PasswordHash::new(hashed).map_err(|_| IdentityError::Hashing)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> IdentityStore {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        IdentityStore::new(db, "test-secret".to_string(), 3600)
    }

    #[tokio::test]
    async fn register_then_login_roundtrip() {
        let store = store().await;
        store.register("alice", "alice@example.com", "hunter2").await.unwrap();

        let token = store.login("alice", "hunter2").await.unwrap();
        let claims = store.decode_token(&token).unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[tokio::test]
    async fn login_with_wrong_password_fails() {
        let store = store().await;
        store.register("bob", "bob@example.com", "correct-horse").await.unwrap();
        let err = store.login("bob", "wrong").await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCredentials));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let store = store().await;
        store.register("carol", "carol@example.com", "pw").await.unwrap();
        let err = store
            .register("carol", "carol2@example.com", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Conflict));
    }
}
