//! Credential store
//!
//! Owns the long-lived identity this client presents to the bridge server:
//! loads it from durable storage, mints a new one through an
//! [`IdentityIssuer`] when needed, and discards it on reset.

mod issuer;
mod storage;

pub use issuer::{HttpIdentityIssuer, IdentityIssuer};
pub use storage::{FileIdentityStorage, IdentityStorage, MemoryIdentityStorage};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BridgeResult;

/// Secret material presented when opening a channel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Secret {
    /// Long-lived user-scoped key
    UserKey {
        /// The key
        key: String,
    },
    /// Short-lived exchange token
    Ephemeral {
        /// The token
        token: String,
        /// Expiry instant
        expires_at: DateTime<Utc>,
        /// Application the token is valid for
        app_id: String,
        /// User the token is valid for
        user_id: String,
    },
}

impl Secret {
    /// Query parameter name and value carrying this secret on the endpoint
    pub fn query_pair(&self) -> (&'static str, &str) {
        match self {
            Self::UserKey { key } => ("secret", key),
            Self::Ephemeral { token, .. } => ("token", token),
        }
    }

    /// Whether the secret can no longer be used at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::UserKey { .. } => false,
            Self::Ephemeral { expires_at, .. } => *expires_at <= now,
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserKey { .. } => f
                .debug_struct("UserKey")
                .field("key", &"[REDACTED]")
                .finish(),
            Self::Ephemeral {
                expires_at,
                app_id,
                user_id,
                ..
            } => f
                .debug_struct("Ephemeral")
                .field("token", &"[REDACTED]")
                .field("expires_at", expires_at)
                .field("app_id", app_id)
                .field("user_id", user_id)
                .finish(),
        }
    }
}

/// Identity used to open a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User identifier
    pub user_id: String,
    /// Secret presented for that user
    pub secret: Secret,
}

impl Identity {
    /// Identity backed by a long-lived user key
    pub fn with_user_key(user_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            secret: Secret::UserKey { key: key.into() },
        }
    }
}

/// Loads, issues and resets the persisted identity for one application.
#[derive(Clone)]
pub struct CredentialStore {
    app_id: String,
    storage: Arc<dyn IdentityStorage>,
    issuer: Arc<dyn IdentityIssuer>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("app_id", &self.app_id)
            .field("storage", &self.storage)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl CredentialStore {
    /// Create a store for `app_id`
    pub fn new(
        app_id: impl Into<String>,
        storage: Arc<dyn IdentityStorage>,
        issuer: Arc<dyn IdentityIssuer>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            storage,
            issuer,
        }
    }

    /// Application this store issues identities for
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Storage key of the persisted identity
    pub fn storage_key(&self) -> String {
        format!("bridge-identity.{}", self.app_id)
    }

    /// Read the persisted identity.
    ///
    /// Returns `None` when nothing is stored. Entries that cannot be parsed,
    /// or ephemeral tokens that have expired, are discarded.
    pub async fn load(&self) -> Option<Identity> {
        let key = self.storage_key();
        let raw = match self.storage.read(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(app_id = %self.app_id, error = %e, "Failed to read persisted identity");
                return None;
            }
        };

        let identity = match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) if !identity.secret.is_expired_at(Utc::now()) => return Some(identity),
            Ok(_) => {
                info!(app_id = %self.app_id, "Persisted identity expired, discarding");
                None
            }
            Err(e) => {
                warn!(app_id = %self.app_id, error = %e, "Discarding corrupt persisted identity");
                None
            }
        };

        if let Err(e) = self.storage.remove(&key).await {
            warn!(app_id = %self.app_id, error = %e, "Failed to discard persisted identity");
        }
        identity
    }

    /// Mint a new identity and persist it.
    pub async fn issue(&self) -> BridgeResult<Identity> {
        let identity = self.issuer.issue(&self.app_id).await?;
        let raw = serde_json::to_string(&identity)?;
        self.storage.write(&self.storage_key(), &raw).await?;
        info!(app_id = %self.app_id, user_id = %identity.user_id, "Issued new identity");
        Ok(identity)
    }

    /// Discard the persisted identity and issue a new one.
    pub async fn reset(&self) -> BridgeResult<Identity> {
        self.storage.remove(&self.storage_key()).await?;
        info!(app_id = %self.app_id, "Discarded persisted identity");
        self.issue().await
    }
}
