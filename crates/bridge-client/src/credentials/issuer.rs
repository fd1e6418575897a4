//! Client for the credential issuance service.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Identity, Secret};
use crate::error::{BridgeError, BridgeResult};

/// Mints new identities for an application.
#[async_trait]
pub trait IdentityIssuer: Send + Sync + fmt::Debug {
    /// Mint a fresh identity for `app_id`.
    ///
    /// Fails with [`BridgeError::Issuance`] when the service is unreachable
    /// or rejects the request.
    async fn issue(&self, app_id: &str) -> BridgeResult<Identity>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssuanceRequest<'a> {
    app_id: &'a str,
    user_id: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IssuanceResponse {
    #[serde(rename_all = "camelCase")]
    Ephemeral {
        token: String,
        expires_at: DateTime<Utc>,
        app_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UserKey {
        #[serde(alias = "key", alias = "secret")]
        user_key: String,
    },
}

/// HTTP issuance client.
///
/// Sends `POST <endpoint>` with `{ appId, userId }`, authenticated with the
/// application key as a bearer token when one is configured. The user id is
/// generated fresh for every issuance.
#[derive(Clone)]
pub struct HttpIdentityIssuer {
    endpoint: String,
    app_key: Option<String>,
    http_client: reqwest::Client,
}

impl fmt::Debug for HttpIdentityIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIdentityIssuer")
            .field("endpoint", &self.endpoint)
            .field("app_key", &self.app_key.as_ref().map(|_| "[REDACTED]"))
            .field("http_client", &"<reqwest::Client>")
            .finish()
    }
}

impl HttpIdentityIssuer {
    /// Create an issuer posting to `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_key: None,
            http_client: reqwest::Client::new(),
        }
    }

    /// Authenticate requests with an application-level key
    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = Some(app_key.into());
        self
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// The issuance endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IdentityIssuer for HttpIdentityIssuer {
    async fn issue(&self, app_id: &str) -> BridgeResult<Identity> {
        let user_id = Uuid::new_v4().to_string();
        debug!(app_id, user_id, endpoint = %self.endpoint, "Requesting identity");

        let mut request = self.http_client.post(&self.endpoint).json(&IssuanceRequest {
            app_id,
            user_id: &user_id,
        });
        if let Some(ref key) = self.app_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::issuance_unreachable(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::issuance_unreachable(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            warn!(app_id, status = status.as_u16(), "Identity issuance rejected");
            return Err(BridgeError::issuance(status.as_u16(), body));
        }

        let parsed: IssuanceResponse = serde_json::from_str(&body).map_err(|e| {
            BridgeError::issuance(status.as_u16(), format!("unexpected response ({e}): {body}"))
        })?;

        Ok(match parsed {
            IssuanceResponse::UserKey { user_key } => Identity {
                user_id,
                secret: Secret::UserKey { key: user_key },
            },
            IssuanceResponse::Ephemeral {
                token,
                expires_at,
                app_id,
                user_id,
            } => Identity {
                user_id: user_id.clone(),
                secret: Secret::Ephemeral {
                    token,
                    expires_at,
                    app_id,
                    user_id,
                },
            },
        })
    }
}
