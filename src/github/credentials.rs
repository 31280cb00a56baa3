//! GitHub App identity: the app id and RSA private key the app signs with.
//!
//! The identity is read from a secret source once and then reused for the
//! lifetime of the [`AppCredentialStore`]. Failed reads are not remembered, so
//! every call retries until one read succeeds.
//!
//! There is no refresh path. A rotated secret is only picked up by building a
//! new store.

use async_trait::async_trait;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::CredentialError;

/// File name of the app id inside a mounted secret directory.
pub const APP_ID_KEY: &str = "github-application-id";

/// File name of the PEM encoded private key inside a mounted secret directory.
pub const PRIVATE_KEY_KEY: &str = "github-private-key";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("secret {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
}

/// Unparsed secret contents.
pub struct RawAppSecret {
    pub app_id: String,
    pub private_key: Vec<u8>,
}

/// Source of the GitHub App secret.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read(&self) -> Result<RawAppSecret, SecretError>;
}

/// Reads the app secret from a directory of files, the layout Kubernetes uses
/// when a secret is mounted as a volume.
pub struct FileSecretReader {
    dir: PathBuf,
}

impl FileSecretReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_key(&self, key: &str) -> Result<Vec<u8>, SecretError> {
        let path = self.dir.join(key);
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => SecretError::NotFound(display_path(&path)),
            _ => SecretError::Malformed {
                name: display_path(&path),
                reason: e.to_string(),
            },
        })
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl SecretReader for FileSecretReader {
    async fn read(&self) -> Result<RawAppSecret, SecretError> {
        debug!(dir = %self.dir.display(), "Reading GitHub App secret");
        let app_id = self.read_key(APP_ID_KEY).await?;
        let app_id = String::from_utf8(app_id).map_err(|e| SecretError::Malformed {
            name: APP_ID_KEY.to_string(),
            reason: e.to_string(),
        })?;
        let private_key = self.read_key(PRIVATE_KEY_KEY).await?;

        Ok(RawAppSecret {
            app_id,
            private_key,
        })
    }
}

/// A parsed GitHub App identity. Only ever constructed from a fully valid
/// secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AppCredential {
    app_id: i64,
    private_key: Vec<u8>,
}

impl AppCredential {
    pub fn new(app_id: i64, private_key: impl Into<Vec<u8>>) -> Result<Self, CredentialError> {
        let private_key = private_key.into();
        if private_key.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(CredentialError::Configuration(
                "GitHub App private key is empty".to_string(),
            ));
        }
        Ok(Self {
            app_id,
            private_key,
        })
    }

    /// Validate raw secret contents.
    pub fn parse(raw: RawAppSecret) -> Result<Self, CredentialError> {
        let app_id = raw.app_id.trim().parse::<i64>().map_err(|e| {
            CredentialError::Configuration(format!("failed to parse GitHub App ID: {}", e))
        })?;
        Self::new(app_id, raw.private_key)
    }

    pub fn app_id(&self) -> i64 {
        self.app_id
    }

    /// PEM encoded RSA private key.
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredential")
            .field("app_id", &self.app_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Write-once holder for the app identity.
pub struct AppCredentialStore {
    reader: Arc<dyn SecretReader>,
    credential: OnceCell<Arc<AppCredential>>,
}

impl AppCredentialStore {
    pub fn new(reader: Arc<dyn SecretReader>) -> Self {
        Self {
            reader,
            credential: OnceCell::new(),
        }
    }

    /// Return the cached identity, loading it on first use.
    ///
    /// Concurrent first callers wait on a single read. A failed read leaves
    /// the store empty and is returned to the caller that ran it; the next
    /// waiter then runs its own read.
    pub async fn get_or_load(&self) -> Result<Arc<AppCredential>, CredentialError> {
        self.credential
            .get_or_try_init(|| async {
                let raw = self
                    .reader
                    .read()
                    .await
                    .map_err(|e| CredentialError::Configuration(e.to_string()))?;
                let credential = AppCredential::parse(raw)?;
                info!(app_id = credential.app_id(), "Loaded GitHub App credential");
                Ok::<_, CredentialError>(Arc::new(credential))
            })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.credential.initialized()
    }
}
