//! Repository to installation directory.
//!
//! The directory answers "which installation of the app owns `org/repo`".
//! It is built by enumerating every installation of the app and every
//! repository each installation can access, and is tagged with the
//! generation it was built for. A lookup under a different generation
//! triggers a full rebuild.
//!
//! The visible state is a single immutable [`DirectorySnapshot`] behind an
//! [`ArcSwapOption`]. A rebuild assembles a new snapshot off to the side and
//! publishes it with one atomic store, so readers see either the old
//! snapshot or the new one. A rebuild that fails, or whose future is dropped,
//! publishes nothing.

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::api_client::{paginate, GitHubApi};
use super::credentials::AppCredential;
use super::{CredentialError, InstallationId};

/// Caller supplied freshness stamp for the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub i64);

impl From<i64> for Generation {
    fn from(value: i64) -> Self {
        Generation(value)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strip one leading and one trailing `/` from a repository full name.
pub fn normalize_repo_name(name: &str) -> &str {
    let name = name.strip_prefix('/').unwrap_or(name);
    name.strip_suffix('/').unwrap_or(name)
}

/// An installation and the repositories it can access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationRecord {
    pub installation_id: InstallationId,
    pub repositories: BTreeSet<String>,
}

/// Result of one complete rebuild.
#[derive(Debug)]
pub struct DirectorySnapshot {
    generation: Generation,
    app_slug: String,
    installations: Vec<InstallationRecord>,
    mapping: HashMap<String, InstallationId>,
}

impl DirectorySnapshot {
    pub fn new(
        generation: Generation,
        app_slug: String,
        installations: Vec<InstallationRecord>,
    ) -> Self {
        let mut mapping = HashMap::new();
        for record in &installations {
            for repo in &record.repositories {
                // first installation listed keeps the repository
                mapping
                    .entry(repo.clone())
                    .or_insert(record.installation_id);
            }
        }

        Self {
            generation,
            app_slug,
            installations,
            mapping,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn app_slug(&self) -> &str {
        &self.app_slug
    }

    pub fn installations(&self) -> &[InstallationRecord] {
        &self.installations
    }

    pub fn lookup(&self, repo: &str) -> Option<InstallationId> {
        self.mapping.get(normalize_repo_name(repo)).copied()
    }

    /// Every repository with its owning installation, sorted by name.
    pub fn repositories(&self) -> Vec<(&str, InstallationId)> {
        let mut repos: Vec<_> = self
            .mapping
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
            .collect();
        repos.sort_unstable();
        repos
    }
}

pub struct InstallationDirectory {
    api: Arc<dyn GitHubApi>,
    current: ArcSwapOption<DirectorySnapshot>,
    rebuild_lock: Mutex<()>,
}

impl InstallationDirectory {
    pub fn new(api: Arc<dyn GitHubApi>) -> Self {
        Self {
            api,
            current: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Generation of the currently visible snapshot.
    pub fn generation(&self) -> Option<Generation> {
        self.current.load_full().map(|s| s.generation)
    }

    /// Currently visible snapshot, whatever its generation.
    pub fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.current.load_full()
    }

    /// Find the installation owning `repo`.
    ///
    /// Rebuilds first when the visible snapshot is not for `generation`. If
    /// that rebuild fails with a transient error and the previous snapshot
    /// knows the repository, the stale answer is returned instead of the
    /// error.
    pub async fn resolve(
        &self,
        credential: &AppCredential,
        repo: &str,
        generation: Generation,
    ) -> Result<InstallationId, CredentialError> {
        let repo = normalize_repo_name(repo);

        let snapshot = match self.refresh(credential, generation).await {
            Ok(snapshot) => snapshot,
            Err(err) => return self.serve_stale(repo, err),
        };

        snapshot
            .lookup(repo)
            .ok_or_else(|| CredentialError::NotFound(repo.to_string()))
    }

    /// Return the snapshot for `generation`, rebuilding if needed.
    ///
    /// At most one rebuild runs at a time. Callers that queued behind a
    /// rebuild for the same generation reuse its result.
    pub async fn refresh(
        &self,
        credential: &AppCredential,
        generation: Generation,
    ) -> Result<Arc<DirectorySnapshot>, CredentialError> {
        if let Some(snapshot) = self.current_for(generation) {
            return Ok(snapshot);
        }

        let _guard = self.rebuild_lock.lock().await;
        if let Some(snapshot) = self.current_for(generation) {
            return Ok(snapshot);
        }

        info!(generation = %generation, "Rebuilding GitHub App installation directory");
        let snapshot = match self.rebuild(credential, generation).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                warn!(
                    generation = %generation,
                    error = %err,
                    "GitHub App installation directory rebuild failed"
                );
                return Err(err);
            }
        };

        self.current.store(Some(snapshot.clone()));
        info!(
            generation = %generation,
            installations = snapshot.installations.len(),
            repositories = snapshot.mapping.len(),
            "GitHub App installation directory rebuilt"
        );

        Ok(snapshot)
    }

    fn current_for(&self, generation: Generation) -> Option<Arc<DirectorySnapshot>> {
        self.current
            .load_full()
            .filter(|snapshot| snapshot.generation == generation)
    }

    fn serve_stale(
        &self,
        repo: &str,
        err: CredentialError,
    ) -> Result<InstallationId, CredentialError> {
        if !matches!(err, CredentialError::Transient(_)) {
            return Err(err);
        }

        let Some(snapshot) = self.current.load_full() else {
            return Err(err);
        };
        match snapshot.lookup(repo) {
            Some(installation_id) => {
                warn!(
                    repo = %repo,
                    installation_id,
                    generation = %snapshot.generation,
                    "Serving installation from previous directory after failed rebuild"
                );
                Ok(installation_id)
            }
            None => Err(err),
        }
    }

    async fn rebuild(
        &self,
        credential: &AppCredential,
        generation: Generation,
    ) -> Result<DirectorySnapshot, CredentialError> {
        let api = self.api.as_ref();

        // fail fast on a bad key or unknown app before enumerating anything
        let app = api
            .get_app(credential)
            .await
            .map_err(CredentialError::from_rebuild)?;

        let mut installations = Vec::new();
        let mut pages = pin!(paginate(move |page| api.list_installations(credential, page)));
        while let Some(page) = pages.next().await {
            for installation_id in page.map_err(CredentialError::from_rebuild)? {
                installations.push(self.enumerate(credential, installation_id).await?);
            }
        }

        Ok(DirectorySnapshot::new(generation, app.slug, installations))
    }

    async fn enumerate(
        &self,
        credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<InstallationRecord, CredentialError> {
        let api = self.api.as_ref();
        let access = api
            .create_installation_token(credential, installation_id)
            .await
            .map_err(CredentialError::from_enumeration)?;
        let token = access.token.as_str();

        let mut repositories = BTreeSet::new();
        let mut pages = pin!(paginate(move |page| {
            api.list_installation_repositories(token, page)
        }));
        while let Some(page) = pages.next().await {
            let page = page.map_err(CredentialError::from_enumeration)?;
            repositories.extend(page.iter().map(|name| normalize_repo_name(name).to_string()));
        }

        debug!(
            installation_id,
            repositories = repositories.len(),
            "Enumerated GitHub App installation"
        );

        Ok(InstallationRecord {
            installation_id,
            repositories,
        })
    }
}
