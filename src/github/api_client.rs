//! GitHub API access for App-level and installation-level calls.
//!
//! [`GitHubApi`] is the seam the resolver talks through. [`GitHubClient`] is
//! the reqwest implementation. Listing endpoints are paginated; a page carries
//! the cursor of the page after it, `0` meaning there is none.

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::credentials::AppCredential;
use super::token_manager::generate_app_jwt;
use super::{ApiError, InstallationId};
use crate::config::GitHubConfig;

const API_VERSION: &str = "2022-11-28";

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the next page, `0` when this is the last one.
    pub next_page: u32,
}

/// GitHub App metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

/// Response from the installation access token endpoint.
///
/// `expires_at` is kept for completeness only; token lifetime is tracked
/// locally.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: Option<String>,
}

#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// `GET /app`, authenticated as the app.
    async fn get_app(&self, credential: &AppCredential) -> Result<AppInfo, ApiError>;

    /// `GET /app/installations`, authenticated as the app.
    async fn list_installations(
        &self,
        credential: &AppCredential,
        page: u32,
    ) -> Result<Page<InstallationId>, ApiError>;

    /// `POST /app/installations/{id}/access_tokens`, authenticated as the app.
    async fn create_installation_token(
        &self,
        credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<InstallationToken, ApiError>;

    /// `GET /installation/repositories`, authenticated with an installation
    /// token. Items are repository full names.
    async fn list_installation_repositories(
        &self,
        access_token: &str,
        page: u32,
    ) -> Result<Page<String>, ApiError>;
}

/// Walk a paginated listing from its first page.
///
/// The stream is lazy and single use: each page is fetched only when polled,
/// and the first error ends it.
pub fn paginate<T, F, Fut>(mut fetch: F) -> impl Stream<Item = Result<Vec<T>, ApiError>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
{
    async_stream::try_stream! {
        let mut page = 1;
        loop {
            let Page { items, next_page } = fetch(page).await?;
            yield items;
            if next_page == 0 {
                break;
            }
            page = next_page;
        }
    }
}

/// Extract the `page` query parameter of the `rel="next"` entry of a `Link`
/// header. Returns `0` when there is no next page.
pub fn next_page_from_link(link: Option<&str>) -> u32 {
    let Some(link) = link else {
        return 0;
    };

    for entry in link.split(',') {
        let mut parts = entry.split(';');
        let Some(target) = parts.next() else {
            continue;
        };
        if !parts.any(|p| p.trim() == r#"rel="next""#) {
            continue;
        }

        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let Ok(url) = Url::parse(target) else {
            continue;
        };
        if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "page") {
            return value.parse().unwrap_or(0);
        }
    }

    0
}

/// reqwest backed [`GitHubApi`].
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    per_page: u32,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build GitHub HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            per_page: config.per_page.clamp(1, 100),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn app_bearer(credential: &AppCredential) -> Result<String, ApiError> {
        let jwt = generate_app_jwt(credential.app_id(), credential.private_key())
            .map_err(|e| ApiError::Signing(e.to_string()))?;
        Ok(format!("Bearer {}", jwt))
    }

    /// Send a request and decode the body. Also returns the next page cursor
    /// taken from the `Link` header.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(T, u32), ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let next_page =
            next_page_from_link(response.headers().get(LINK).and_then(|v| v.to_str().ok()));
        let body = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok((body, next_page))
    }
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: InstallationId,
}

#[derive(Debug, Deserialize)]
struct ListReposResponse {
    repositories: Vec<RepositoryResponse>,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    full_name: String,
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn get_app(&self, credential: &AppCredential) -> Result<AppInfo, ApiError> {
        let request = self
            .client
            .get(self.url("/app"))
            .header(AUTHORIZATION, Self::app_bearer(credential)?);
        let (app, _) = self.send(request).await?;
        Ok(app)
    }

    async fn list_installations(
        &self,
        credential: &AppCredential,
        page: u32,
    ) -> Result<Page<InstallationId>, ApiError> {
        debug!(page, "Listing GitHub App installations");
        let request = self
            .client
            .get(self.url("/app/installations"))
            .query(&[("per_page", self.per_page), ("page", page)])
            .header(AUTHORIZATION, Self::app_bearer(credential)?);
        let (installations, next_page): (Vec<InstallationResponse>, _) =
            self.send(request).await?;

        Ok(Page {
            items: installations.into_iter().map(|i| i.id).collect(),
            next_page,
        })
    }

    async fn create_installation_token(
        &self,
        credential: &AppCredential,
        installation_id: InstallationId,
    ) -> Result<InstallationToken, ApiError> {
        let request = self
            .client
            .post(self.url(&format!(
                "/app/installations/{}/access_tokens",
                installation_id
            )))
            .header(AUTHORIZATION, Self::app_bearer(credential)?);
        let (token, _) = self.send(request).await?;
        Ok(token)
    }

    async fn list_installation_repositories(
        &self,
        access_token: &str,
        page: u32,
    ) -> Result<Page<String>, ApiError> {
        let request = self
            .client
            .get(self.url("/installation/repositories"))
            .query(&[("per_page", self.per_page), ("page", page)])
            .header(AUTHORIZATION, format!("Bearer {}", access_token));
        let (response, next_page): (ListReposResponse, _) = self.send(request).await?;

        Ok(Page {
            items: response
                .repositories
                .into_iter()
                .map(|r| r.full_name)
                .collect(),
            next_page,
        })
    }
}
