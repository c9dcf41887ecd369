//! HTTP client for the external content API.
//!
//! Every call forwards the caller's session cookie; the API decides what
//! the caller may see.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Content API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid content API base URL: {0}")]
    InvalidBaseUrl(String),
}

/// The user owning the forwarded cookie.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// The caller's membership in a project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectMembership {
    pub role: u8,
}

#[derive(Debug, Serialize)]
struct DescriptionPayload {
    description_binary: String,
}

/// Path to a project page resource.
#[derive(Debug, Clone, Copy)]
pub struct PagePath<'a> {
    pub workspace_slug: &'a str,
    pub project_id: &'a str,
    pub page_id: &'a str,
}

/// Bound on every content API request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ContentApi {
    client: reqwest::Client,
    base_url: String,
}

impl ContentApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    /// Client whose requests fail once `timeout` elapses.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidBaseUrl(base_url));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn current_user(&self, cookie: &str) -> Result<CurrentUser, ApiError> {
        let user = self
            .client
            .get(format!("{}/api/users/me/", self.base_url))
            .header(COOKIE, cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(user)
    }

    pub async fn project_membership(
        &self,
        workspace_slug: &str,
        project_id: &str,
        cookie: &str,
    ) -> Result<ProjectMembership, ApiError> {
        let membership = self
            .client
            .get(format!(
                "{}/api/workspaces/{workspace_slug}/projects/{project_id}/project-members/me/",
                self.base_url
            ))
            .header(COOKIE, cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(membership)
    }

    /// Raw binary description of a page; empty when none was stored yet.
    pub async fn fetch_page_description(
        &self,
        page: PagePath<'_>,
        cookie: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let bytes = self
            .client
            .get(self.description_url(page))
            .header(COOKIE, cookie)
            .header(CONTENT_TYPE, "application/octet-stream")
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    pub async fn update_page_description(
        &self,
        page: PagePath<'_>,
        state: &[u8],
        cookie: &str,
    ) -> Result<(), ApiError> {
        let payload = DescriptionPayload {
            description_binary: STANDARD.encode(state),
        };
        self.client
            .patch(self.description_url(page))
            .header(COOKIE, cookie)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn description_url(&self, page: PagePath<'_>) -> String {
        format!(
            "{}/api/workspaces/{}/projects/{}/pages/{}/description/",
            self.base_url, page.workspace_slug, page.project_id, page.page_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let api = ContentApi::new("http://api.local:8000/").unwrap();
        assert_eq!(api.base_url(), "http://api.local:8000");
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        assert!(matches!(
            ContentApi::new("api.local"),
            Err(ApiError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_description_url() {
        let api = ContentApi::new("https://plane.example").unwrap();
        let url = api.description_url(PagePath {
            workspace_slug: "acme",
            project_id: "p1",
            page_id: "pg9",
        });
        assert_eq!(
            url,
            "https://plane.example/api/workspaces/acme/projects/p1/pages/pg9/description/"
        );
    }

    #[tokio::test]
    async fn test_unresponsive_api_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let api = ContentApi::with_timeout(format!("http://{addr}"), Duration::from_millis(100))
            .unwrap();
        let started = std::time::Instant::now();
        let result = api.current_user("session=abc").await;

        assert!(matches!(result, Err(ApiError::Http(e)) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
