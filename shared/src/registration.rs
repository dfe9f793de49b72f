// ============================================================================
// Registration workflow
// ============================================================================
//
// Creates the account, then announces it:
//
// 1. validate input
// 2. reject an email that is already registered
// 3. hash the password (Argon2id) - plaintext never reaches the store
// 4. persist the account
// 5. publish UserRegistered keyed by email
//
// Step 5 runs only after step 4 succeeded, and its failure never fails the
// registration: a retryable failure is handed to a background task with
// bounded retry, anything else is logged and dropped.
//
// ============================================================================

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_error::{AppError, AppResult};
use rand::rngs::OsRng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::DeliveryReceipt;
use crate::events::UserRegisteredEvent;
use crate::publisher::EventPublisher;
use crate::utils::{log_safe_id, validate_email, validate_password, validate_username};

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence of account records
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn email_exists(&self, email: &str) -> AppResult<bool>;

    /// Durably store `account`; fails with `Conflict` if the email is taken
    async fn insert(&self, account: Account) -> AppResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, email: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .get(&email.to_ascii_lowercase())
            .cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn email_exists(&self, email: &str) -> AppResult<bool> {
        Ok(self
            .accounts
            .read()
            .await
            .contains_key(&email.to_ascii_lowercase()))
    }

    async fn insert(&self, account: Account) -> AppResult<()> {
        let mut accounts = self.accounts.write().await;
        let key = account.email.to_ascii_lowercase();
        if accounts.contains_key(&key) {
            return Err(AppError::conflict("Email already exists"));
        }
        accounts.insert(key, account);
        Ok(())
    }
}

/// What happened to the UserRegistered announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    Published(DeliveryReceipt),
    /// First attempt failed; a background task keeps retrying
    RetryScheduled,
    /// Failed in a way retrying cannot fix; logged only
    Dropped,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub account_id: Uuid,
    pub notification: NotificationStatus,
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::internal(format!("password hashing failed: {}", e)))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub struct RegistrationService {
    accounts: Arc<dyn AccountStore>,
    publisher: EventPublisher,
    shutdown: CancellationToken,
    log_salt: String,
}

impl RegistrationService {
    /// Fails with `Config` when `log_salt` is empty
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        publisher: EventPublisher,
        log_salt: impl Into<String>,
    ) -> AppResult<Self> {
        let log_salt = log_salt.into();
        if log_salt.trim().is_empty() {
            return Err(AppError::config("LOG_HASH_SALT must not be empty"));
        }
        Ok(Self {
            accounts,
            publisher,
            shutdown: CancellationToken::new(),
            log_salt,
        })
    }

    /// Token that stops background publish retries
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn register(&self, request: RegisterRequest) -> AppResult<Registration> {
        let email = request.email.trim().to_string();
        let username = request.username.trim().to_string();

        validate_email(&email).map_err(AppError::validation)?;
        validate_username(&username).map_err(AppError::validation)?;
        validate_password(&request.password).map_err(AppError::validation)?;

        if self.accounts.email_exists(&email).await? {
            return Err(AppError::conflict("Email already exists"));
        }

        // Argon2 is CPU-bound for tens of milliseconds
        let password = request.password;
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AppError::internal(format!("password hashing task failed: {}", e)))??;

        let account = Account {
            id: Uuid::new_v4(),
            username: username.clone(),
            email: email.clone(),
            password_hash,
            created_at: Utc::now(),
        };
        let account_id = account.id;
        self.accounts.insert(account).await?;

        let user_hash = log_safe_id(&email, &self.log_salt);
        info!(user_hash = %user_hash, "Account created");

        let event = UserRegisteredEvent::new(email.clone(), username);
        let notification = match self.publisher.publish(&email, &event).await {
            Ok(receipt) => NotificationStatus::Published(receipt),
            Err(e) if e.is_retryable() => {
                warn!(
                    user_hash = %user_hash,
                    error = %e,
                    "UserRegistered publish failed, retrying in background"
                );
                let publisher = self.publisher.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = publisher.publish_with_retry(&email, &event, &shutdown).await {
                        error!(
                            user_hash = %user_hash,
                            error = %e,
                            "UserRegistered event lost, welcome notification will not be sent"
                        );
                    }
                });
                NotificationStatus::RetryScheduled
            }
            Err(e) => {
                error!(
                    user_hash = %user_hash,
                    error = %e,
                    "UserRegistered event rejected, welcome notification will not be sent"
                );
                NotificationStatus::Dropped
            }
        };

        Ok(Registration {
            account_id,
            notification,
        })
    }
}
