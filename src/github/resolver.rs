//! Repository credential resolution.
//!
//! [`CredentialResolver`] owns the app credential, the installation directory
//! and the token cache. Build one per process and share it (it is `Send +
//! Sync`, wrap it in an `Arc`) between every worker that needs to talk to
//! GitHub on behalf of a repository.
//!
//! Dropping a `get_token` future part way leaves every cache as it was before
//! the call: state is only ever published at the end of a successful step.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::api_client::{GitHubApi, GitHubClient};
use super::cache::TokenCache;
use super::credentials::{AppCredential, AppCredentialStore, FileSecretReader, SecretReader};
use super::directory::{DirectorySnapshot, Generation, InstallationDirectory};
use super::token_manager::TokenIssuer;
use super::{CredentialError, InstallationId};
use crate::config::{Config, TokenConfig};

pub struct CredentialResolver {
    credentials: AppCredentialStore,
    directory: InstallationDirectory,
    cache: TokenCache,
    issuer: TokenIssuer,
    mint_locks: DashMap<InstallationId, Arc<Mutex<()>>>,
}

impl CredentialResolver {
    pub fn new(
        secrets: Arc<dyn SecretReader>,
        api: Arc<dyn GitHubApi>,
        tokens: &TokenConfig,
    ) -> Self {
        let tokens = tokens.clone().validated();
        Self {
            credentials: AppCredentialStore::new(secrets),
            directory: InstallationDirectory::new(api.clone()),
            cache: TokenCache::new(tokens.renewal_threshold()),
            issuer: TokenIssuer::new(api, tokens.validity()),
            mint_locks: DashMap::new(),
        }
    }

    /// Resolver talking to the configured GitHub API with the app secret
    /// mounted at `github.secret_dir`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api = Arc::new(GitHubClient::new(&config.github)?);
        let secrets = Arc::new(FileSecretReader::new(&config.github.secret_dir));
        Ok(Self::new(secrets, api, &config.tokens))
    }

    /// Installation access token usable against `repo`.
    ///
    /// `generation` decides whether the installation directory may be reused
    /// (see [`InstallationDirectory::resolve`]). Cached tokens are reused
    /// regardless of generation as long as they are not close to expiry.
    pub async fn get_token(
        &self,
        repo: &str,
        generation: Generation,
    ) -> Result<String, CredentialError> {
        let credential = self.credentials.get_or_load().await?;
        let installation_id = self.directory.resolve(&credential, repo, generation).await?;
        self.installation_token(&credential, installation_id).await
    }

    /// [`get_token`](Self::get_token) formatted as an `Authorization` header
    /// value.
    pub async fn authorization_header(
        &self,
        repo: &str,
        generation: Generation,
    ) -> Result<String, CredentialError> {
        let token = self.get_token(repo, generation).await?;
        Ok(format!("Bearer {}", token))
    }

    pub async fn resolve_installation(
        &self,
        repo: &str,
        generation: Generation,
    ) -> Result<InstallationId, CredentialError> {
        let credential = self.credentials.get_or_load().await?;
        self.directory.resolve(&credential, repo, generation).await
    }

    /// Directory snapshot for `generation`, rebuilding if needed.
    pub async fn directory_snapshot(
        &self,
        generation: Generation,
    ) -> Result<Arc<DirectorySnapshot>, CredentialError> {
        let credential = self.credentials.get_or_load().await?;
        self.directory.refresh(&credential, generation).await
    }

    /// Login GitHub shows for commits and comments made by the app.
    pub async fn bot_username(&self, generation: Generation) -> Result<String, CredentialError> {
        let snapshot = self.directory_snapshot(generation).await?;
        Ok(format!("{}[bot]", snapshot.app_slug()))
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Cached token for the installation, minting one on a miss.
    ///
    /// Misses are coalesced per installation: the first caller mints while
    /// the others wait on the installation's lock and then pick the fresh
    /// token out of the cache.
    async fn installation_token(
        &self,
        credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<String, CredentialError> {
        if let Some(record) = self.cache.get(installation_id) {
            debug!(installation_id, "Using cached installation token");
            return Ok(record.token);
        }

        let lock = self.mint_locks.entry(installation_id).or_default().value().clone();
        let _guard = lock.lock().await;

        if let Some(record) = self.cache.get(installation_id) {
            debug!(installation_id, "Installation token minted by another caller");
            return Ok(record.token);
        }

        let record = self.issuer.mint(credential, installation_id).await?;
        let token = record.token.clone();
        self.cache.set(installation_id, record);

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::cache::TokenRecord;
    use crate::github::testing::{FakeGitHub, StaticSecrets};
    use crate::github::ApiError;
    use chrono::{Duration, Utc};

    const INSTALLATION_A: InstallationId = 100;
    const INSTALLATION_B: InstallationId = 200;

    fn fake() -> FakeGitHub {
        FakeGitHub::new()
            .with_installation(INSTALLATION_A, &["org/repoA", "org/repoB"])
            .with_installation(INSTALLATION_B, &["org/repoC"])
    }

    fn resolver(api: Arc<FakeGitHub>) -> CredentialResolver {
        CredentialResolver::new(
            Arc::new(StaticSecrets::new("12345", "key")),
            api,
            &TokenConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_get_token_mints_then_caches() {
        let api = Arc::new(fake());
        let resolver = resolver(api.clone());

        let token = resolver.get_token("org/repoA", Generation(1)).await.unwrap();
        assert!(token.starts_with(&format!("ghs-{}-", INSTALLATION_A)));
        let mints = api.mint_calls();

        // same installation, different repository
        let again = resolver.get_token("/org/repoB/", Generation(1)).await.unwrap();
        assert_eq!(again, token);
        assert_eq!(api.mint_calls(), mints);

        let other = resolver.get_token("org/repoC", Generation(1)).await.unwrap();
        assert!(other.starts_with(&format!("ghs-{}-", INSTALLATION_B)));
        assert_eq!(api.mint_calls(), mints + 1);
        assert_eq!(resolver.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_token_survives_generation_bump() {
        let api = Arc::new(fake());
        let resolver = resolver(api.clone());

        let token = resolver.get_token("org/repoA", Generation(1)).await.unwrap();
        let mints = api.mint_calls();

        let again = resolver.get_token("org/repoA", Generation(2)).await.unwrap();
        assert_eq!(again, token);
        assert_eq!(api.app_calls(), 2);
        // the rebuild mints one enumeration token per installation, nothing else
        assert_eq!(api.mint_calls(), mints + 2);
    }

    #[tokio::test]
    async fn test_near_expiry_token_is_replaced() {
        let api = Arc::new(fake());
        let resolver = resolver(api.clone());
        resolver
            .resolve_installation("org/repoA", Generation(1))
            .await
            .unwrap();

        resolver.cache().set(
            INSTALLATION_A,
            TokenRecord::new("stale", Utc::now() + Duration::minutes(10)),
        );
        let token = resolver.get_token("org/repoA", Generation(1)).await.unwrap();
        assert_ne!(token, "stale");
        assert_eq!(resolver.cache().get(INSTALLATION_A).unwrap().token, token);
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let resolver = resolver(Arc::new(fake()));
        let result = resolver.get_token("org/repoX", Generation(1)).await;
        assert_eq!(result, Err(CredentialError::NotFound("org/repoX".to_string())));
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_mint_failure_is_not_cached() {
        let api = Arc::new(fake());
        let resolver = resolver(api.clone());
        resolver
            .resolve_installation("org/repoA", Generation(1))
            .await
            .unwrap();

        api.fail_minting(Some(ApiError::Transport("timed out".to_string())));
        let result = resolver.get_token("org/repoA", Generation(1)).await;
        assert!(matches!(result, Err(CredentialError::Mint { .. })));
        assert!(resolver.cache().is_empty());

        api.fail_minting(None);
        assert!(resolver.get_token("org/repoA", Generation(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let resolver = CredentialResolver::new(
            Arc::new(StaticSecrets::new("12345", "key").failing_first(1)),
            Arc::new(fake()),
            &TokenConfig::default(),
        );

        assert!(matches!(
            resolver.get_token("org/repoA", Generation(1)).await,
            Err(CredentialError::Configuration(_))
        ));
        assert!(resolver.get_token("org/repoA", Generation(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_misses_mint_once() {
        let api = Arc::new(fake().with_mint_delay(std::time::Duration::from_millis(20)));
        let resolver = Arc::new(resolver(api.clone()));
        resolver
            .resolve_installation("org/repoA", Generation(1))
            .await
            .unwrap();
        let mints = api.mint_calls();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.get_token("org/repoA", Generation(1)).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }
        tokens.dedup();
        assert_eq!(tokens.len(), 1);
        assert_eq!(api.mint_calls(), mints + 1);
    }

    #[tokio::test]
    async fn test_inverted_token_windows_never_serve_expired_tokens() {
        let tokens = TokenConfig {
            validity_minutes: 10,
            usage_window_minutes: 20,
        };
        let resolver = CredentialResolver::new(
            Arc::new(StaticSecrets::new("12345", "key")),
            Arc::new(fake()),
            &tokens,
        );
        assert_eq!(
            resolver.cache().renewal_threshold(),
            TokenConfig::default().renewal_threshold()
        );

        resolver
            .resolve_installation("org/repoA", Generation(1))
            .await
            .unwrap();
        resolver.cache().set(
            INSTALLATION_A,
            TokenRecord::new("expired", Utc::now() - Duration::minutes(5)),
        );
        let token = resolver.get_token("org/repoA", Generation(1)).await.unwrap();
        assert_ne!(token, "expired");
    }

    #[tokio::test]
    async fn test_dropped_mint_leaves_cache_untouched() {
        let api = Arc::new(fake());
        let resolver = resolver(api.clone());
        resolver
            .resolve_installation("org/repoA", Generation(1))
            .await
            .unwrap();

        api.set_mint_delay(Some(std::time::Duration::from_millis(500)));
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            resolver.get_token("org/repoA", Generation(1)),
        )
        .await;
        assert!(result.is_err());
        assert!(resolver.cache().is_empty());

        // the installation lock was released with the dropped future
        api.set_mint_delay(None);
        let token = resolver.get_token("org/repoA", Generation(1)).await.unwrap();
        assert_eq!(resolver.cache().get(INSTALLATION_A).unwrap().token, token);
    }

    #[tokio::test]
    async fn test_authorization_header_and_bot_username() {
        let resolver = resolver(Arc::new(fake()));

        let header = resolver
            .authorization_header("org/repoC", Generation(1))
            .await
            .unwrap();
        assert!(header.starts_with("Bearer ghs-200-"));

        let username = resolver.bot_username(Generation(1)).await.unwrap();
        assert_eq!(username, "mintauth-test[bot]");
    }
}
