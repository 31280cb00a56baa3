//! Error types for GitHub App credential resolution.
//!
//! Upstream calls fail with an [`ApiError`]. Components classify those into a
//! [`CredentialError`] at their boundary so callers can decide whether to
//! retry, back off or alert. Nothing in this module retries on its own.

use thiserror::Error;

use super::InstallationId;

/// Failure of a single call against the GitHub API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("GitHub API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GitHub API request failed: {0}")]
    Transport(String),

    #[error("Failed to parse GitHub API response: {0}")]
    Decode(String),

    #[error("Failed to sign GitHub App JWT: {0}")]
    Signing(String),
}

impl ApiError {
    /// HTTP status code, if the request reached GitHub at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors returned to callers of the credential resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// App identity is missing or malformed. Fatal until the secret is fixed.
    #[error("GitHub App configuration error: {0}")]
    Configuration(String),

    #[error("GitHub Application private key does not match Application ID")]
    InvalidCredentials,

    #[error("GitHub Application with given ID does not exist")]
    AppNotFound,

    /// Any other upstream failure while enumerating installations.
    #[error("Error getting GitHub Application installations: {0}")]
    Transient(#[source] ApiError),

    #[error("Repository {0} not found in any GitHub App installation")]
    NotFound(String),

    #[error("Failed to mint token for installation {installation_id}: {source}")]
    Mint {
        installation_id: InstallationId,
        #[source]
        source: ApiError,
    },
}

impl CredentialError {
    /// Whether a later attempt at the same call could succeed without any
    /// operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CredentialError::Transient(_) | CredentialError::Mint { .. })
    }

    /// Classify a failure hit while rebuilding the installation directory.
    pub(crate) fn from_rebuild(err: ApiError) -> Self {
        match err {
            ApiError::Status { status: 401, .. } => CredentialError::InvalidCredentials,
            ApiError::Status { status: 404, .. } => CredentialError::AppNotFound,
            ApiError::Signing(reason) => CredentialError::Configuration(reason),
            other => CredentialError::Transient(other),
        }
    }

    /// Classify a failure hit while enumerating one installation's
    /// repositories. Status codes here concern that installation only and are
    /// never fatal.
    pub(crate) fn from_enumeration(err: ApiError) -> Self {
        match err {
            ApiError::Signing(reason) => CredentialError::Configuration(reason),
            other => CredentialError::Transient(other),
        }
    }

    pub(crate) fn from_mint(installation_id: InstallationId, source: ApiError) -> Self {
        CredentialError::Mint {
            installation_id,
            source,
        }
    }
}
