//! Token management for GitHub App authentication.
//!
//! GitHub Apps use two types of authentication:
//! 1. App JWT - Short-lived JWT signed with the app's private key (for app-level operations)
//! 2. Installation Access Token - Token for a specific installation (for repo operations)

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::api_client::GitHubApi;
use super::cache::TokenRecord;
use super::credentials::AppCredential;
use super::{CredentialError, InstallationId};

/// JWT claims for GitHub App authentication.
/// GitHub requires: iat (issued at), exp (expiration), iss (issuer = app_id)
#[derive(Debug, Serialize, Deserialize)]
struct GitHubAppClaims {
    /// Issued at time (Unix timestamp)
    iat: i64,
    /// Expiration time (Unix timestamp) - max 10 minutes
    exp: i64,
    /// Issuer - the GitHub App ID
    iss: String,
}

/// Generate a JWT for GitHub App authentication.
///
/// The JWT is signed with RS256 (RSA-SHA256) using the app's private key.
/// It's valid for 10 minutes (GitHub's maximum).
pub fn generate_app_jwt(
    app_id: i64,
    private_key_pem: &[u8],
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    // Issue time: 60 seconds in the past to account for clock drift
    let iat = now - Duration::seconds(60);
    let exp = now + Duration::minutes(10);

    let claims = GitHubAppClaims {
        iat: iat.timestamp(),
        exp: exp.timestamp(),
        iss: app_id.to_string(),
    };

    let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)?;
    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
}

/// Mints installation access tokens.
///
/// The expiry of a minted token is `now + validity`. Whatever expiry GitHub
/// reports is ignored.
pub struct TokenIssuer {
    api: Arc<dyn GitHubApi>,
    validity: Duration,
}

impl TokenIssuer {
    pub fn new(api: Arc<dyn GitHubApi>, validity: Duration) -> Self {
        Self { api, validity }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub async fn mint(
        &self,
        credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<TokenRecord, CredentialError> {
        let token = self
            .api
            .create_installation_token(credential, installation_id)
            .await
            .map_err(|e| CredentialError::from_mint(installation_id, e))?;

        let expires_at: DateTime<Utc> = Utc::now() + self.validity;
        debug!(
            installation_id,
            expires_at = %expires_at,
            "Minted GitHub App installation token"
        );

        Ok(TokenRecord::new(token.token, expires_at))
    }
}
