//! In-memory stand-ins for GitHub and the secret source.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::api_client::{AppInfo, GitHubApi, InstallationToken, Page};
use super::credentials::{AppCredential, RawAppSecret, SecretError, SecretReader};
use super::{ApiError, InstallationId};

const REPOSITORIES_PER_PAGE: usize = 2;

#[derive(Default)]
struct FakeState {
    installations: Vec<(InstallationId, Vec<String>)>,
    listing_failure: Option<ApiError>,
    repository_failure: Option<ApiError>,
    mint_failure: Option<ApiError>,
    mint_delay: Option<Duration>,
}

/// Fake GitHub serving one installation per page and two repositories per
/// page, so every listing exercises pagination.
#[derive(Default)]
pub(crate) struct FakeGitHub {
    state: Mutex<FakeState>,
    app_calls: AtomicUsize,
    listing_calls: AtomicUsize,
    mint_calls: AtomicUsize,
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installation(self, id: InstallationId, repositories: &[&str]) -> Self {
        self.state
            .lock()
            .installations
            .push((id, repositories.iter().map(|r| r.to_string()).collect()));
        self
    }

    pub fn with_mint_delay(self, delay: Duration) -> Self {
        self.state.lock().mint_delay = Some(delay);
        self
    }

    pub fn set_mint_delay(&self, delay: Option<Duration>) {
        self.state.lock().mint_delay = delay;
    }

    pub fn set_installations(&self, installations: Vec<(InstallationId, Vec<&str>)>) {
        self.state.lock().installations = installations
            .into_iter()
            .map(|(id, repos)| (id, repos.into_iter().map(String::from).collect()))
            .collect();
    }

    pub fn fail_listing(&self, failure: Option<ApiError>) {
        self.state.lock().listing_failure = failure;
    }

    pub fn fail_repositories(&self, failure: Option<ApiError>) {
        self.state.lock().repository_failure = failure;
    }

    pub fn fail_minting(&self, failure: Option<ApiError>) {
        self.state.lock().mint_failure = failure;
    }

    pub fn app_calls(&self) -> usize {
        self.app_calls.load(Ordering::SeqCst)
    }

    /// Number of installation listing pages requested.
    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    /// Number of installation tokens created, for enumeration or otherwise.
    pub fn mint_calls(&self) -> usize {
        self.mint_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitHubApi for FakeGitHub {
    async fn get_app(&self, credential: &AppCredential) -> Result<AppInfo, ApiError> {
        self.app_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AppInfo {
            id: credential.app_id(),
            slug: "mintauth-test".to_string(),
            name: "MintAuth Test".to_string(),
        })
    }

    async fn list_installations(
        &self,
        _credential: &AppCredential,
        page: u32,
    ) -> Result<Page<InstallationId>, ApiError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(failure) = &state.listing_failure {
            return Err(failure.clone());
        }

        let index = page.saturating_sub(1) as usize;
        let items = state
            .installations
            .get(index)
            .map(|(id, _)| vec![*id])
            .unwrap_or_default();
        let next_page = if index + 1 < state.installations.len() {
            page + 1
        } else {
            0
        };

        Ok(Page { items, next_page })
    }

    async fn create_installation_token(
        &self,
        _credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<InstallationToken, ApiError> {
        let (failure, delay) = {
            let state = self.state.lock();
            (state.mint_failure.clone(), state.mint_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        let n = self.mint_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InstallationToken {
            token: format!("ghs-{}-{}", installation_id, n),
            expires_at: None,
        })
    }

    async fn list_installation_repositories(
        &self,
        access_token: &str,
        page: u32,
    ) -> Result<Page<String>, ApiError> {
        let state = self.state.lock();
        if let Some(failure) = &state.repository_failure {
            return Err(failure.clone());
        }

        let installation_id: Option<InstallationId> =
            access_token.split('-').nth(1).and_then(|id| id.parse().ok());
        let Some((_, repositories)) = state
            .installations
            .iter()
            .find(|(id, _)| Some(*id) == installation_id)
        else {
            return Err(ApiError::Status {
                status: 401,
                body: "Bad credentials".to_string(),
            });
        };

        let start = page.saturating_sub(1) as usize * REPOSITORIES_PER_PAGE;
        let items: Vec<String> = repositories
            .iter()
            .skip(start)
            .take(REPOSITORIES_PER_PAGE)
            .cloned()
            .collect();
        let next_page = if start + REPOSITORIES_PER_PAGE < repositories.len() {
            page + 1
        } else {
            0
        };

        Ok(Page { items, next_page })
    }
}

/// Secret source returning fixed contents, optionally failing the first few
/// reads.
pub(crate) struct StaticSecrets {
    app_id: String,
    private_key: Vec<u8>,
    fail_first: usize,
    reads: AtomicUsize,
}

impl StaticSecrets {
    pub fn new(app_id: &str, private_key: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            private_key: private_key.as_bytes().to_vec(),
            fail_first: 0,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(mut self, reads: usize) -> Self {
        self.fail_first = reads;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretReader for StaticSecrets {
    async fn read(&self) -> Result<RawAppSecret, SecretError> {
        let attempt = self.reads.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(SecretError::NotFound("pipelines-as-code-secret".to_string()));
        }
        Ok(RawAppSecret {
            app_id: self.app_id.clone(),
            private_key: self.private_key.clone(),
        })
    }
}
