//! Bearer-token verification against the identity service.
//!
//! The engine treats identity as an opaque outbound call: any 2xx
//! response with a non-empty user id is a valid identity, everything
//! else (including transport failures) is unauthorized.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token verification failed")]
    Rejected,
}

#[derive(Debug, Deserialize)]
struct IdentityUser {
    #[serde(default)]
    id: String,
}

pub struct IdentityVerifier {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl IdentityVerifier {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            anon_key: anon_key.into(),
        }
    }

    /// Endpoint tokens are checked against; logged at startup.
    pub fn verify_url(&self) -> String {
        format!("{}/auth/v1/user", self.base_url)
    }

    /// Verify a bearer token, returning the authenticated user id.
    pub async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let resp = self
            .client
            .get(self.verify_url())
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| {
                debug!(error = %err, "identity request failed");
                AuthError::Rejected
            })?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), "identity check rejected token");
            return Err(AuthError::Rejected);
        }

        let user: IdentityUser = resp.json().await.map_err(|err| {
            debug!(error = %err, "identity response decode failed");
            AuthError::Rejected
        })?;
        if user.id.is_empty() {
            return Err(AuthError::Rejected);
        }
        Ok(user.id)
    }
}
