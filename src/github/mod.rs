//! GitHub App credential resolution.
//!
//! This module provides:
//! - App identity loading from a mounted secret
//! - JWT generation and installation access token minting
//! - A repository to installation directory built from the GitHub API
//! - A time aware cache of installation tokens
//! - [`CredentialResolver`], which combines all of the above

pub mod api_client;
pub mod cache;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod resolver;
pub mod token_manager;

#[cfg(test)]
pub(crate) mod testing;

/// GitHub App installation id.
pub type InstallationId = i64;

pub use api_client::{GitHubApi, GitHubClient};
pub use cache::{TokenCache, TokenRecord};
pub use credentials::{AppCredential, AppCredentialStore, FileSecretReader, SecretReader};
pub use directory::{normalize_repo_name, Generation, InstallationDirectory};
pub use error::{ApiError, CredentialError};
pub use resolver::CredentialResolver;
pub use token_manager::{generate_app_jwt, TokenIssuer};
