//! Credential verification for incoming sessions.
//!
//! A session presents two credentials: the session cookie sent with the
//! upgrade request and an identity token sent in the first frame. The cookie
//! is checked locally before anything else; the token is checked by a
//! [`CredentialVerifier`] against the external identity service.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::api::ContentApi;
use crate::context::{DocumentType, Identity, RequestContext};

/// Project role from which members may edit pages.
pub const MEMBER_ROLE: u8 = 15;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Credentials not provided")]
    MissingCredentials,
    #[error("Authentication unsuccessful: {0}")]
    Rejected(String),
}

/// Everything known about a connection when it authenticates.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub session_id: Uuid,
    pub cookie: &'a str,
    pub context: &'a RequestContext,
    pub token: &'a str,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Confirm the caller and resolve its identity.
    async fn verify(&self, request: AuthRequest<'_>) -> Result<Identity, AuthError>;
}

/// The session cookie of a request, or `MissingCredentials`.
pub fn require_cookie(context: &RequestContext) -> Result<&str, AuthError> {
    context.cookie().ok_or(AuthError::MissingCredentials)
}

/// Authenticate one connection.
///
/// The verifier is consulted at most once and only when a cookie is present.
pub async fn authenticate(
    verifier: &dyn CredentialVerifier,
    session_id: Uuid,
    context: &RequestContext,
    token: &str,
) -> Result<Identity, AuthError> {
    let cookie = require_cookie(context)?;
    let request = AuthRequest {
        session_id,
        cookie,
        context,
        token,
    };
    verifier.verify(request).await.map_err(|e| match e {
        AuthError::MissingCredentials => AuthError::MissingCredentials,
        AuthError::Rejected(reason) => {
            log::warn!("Session {session_id} failed authentication: {reason}");
            AuthError::Rejected(reason)
        }
    })
}

/// Verifies callers against the content API.
///
/// The token must be the id of the user owning the cookie. Project pages
/// additionally require a project membership; roles below
/// [`MEMBER_ROLE`] get read-only sessions.
pub struct ContentApiVerifier {
    api: ContentApi,
}

impl ContentApiVerifier {
    pub fn new(api: ContentApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CredentialVerifier for ContentApiVerifier {
    async fn verify(&self, request: AuthRequest<'_>) -> Result<Identity, AuthError> {
        let user = self.api.current_user(request.cookie).await.map_err(|e| {
            log::error!("Failed to fetch current user: {e}");
            AuthError::Rejected(e.to_string())
        })?;

        if user.id != request.token {
            return Err(AuthError::Rejected(
                "token doesn't match the current user".to_string(),
            ));
        }

        match request.context.document_type() {
            Some(DocumentType::ProjectPage) => {
                let (Some(workspace_slug), Some(project_id)) = (
                    request.context.workspace_slug(),
                    request.context.project_id(),
                ) else {
                    return Err(AuthError::Rejected(
                        "incomplete query params, workspaceSlug or projectId is missing"
                            .to_string(),
                    ));
                };

                let membership = self
                    .api
                    .project_membership(workspace_slug, project_id, request.cookie)
                    .await
                    .map_err(|e| {
                        log::error!("Failed to fetch project membership: {e}");
                        AuthError::Rejected(e.to_string())
                    })?;

                Ok(Identity {
                    user_id: user.id,
                    display_name: user.display_name,
                    read_only: membership.role < MEMBER_ROLE,
                })
            }
            Some(other) => Err(AuthError::Rejected(format!(
                "invalid document type {other} provided"
            ))),
            None => Err(AuthError::Rejected("document type not provided".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVerifier {
        calls: AtomicUsize,
        accept: bool,
    }

    #[async_trait]
    impl CredentialVerifier for CountingVerifier {
        async fn verify(&self, request: AuthRequest<'_>) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(Identity::new(request.token))
            } else {
                Err(AuthError::Rejected("nope".to_string()))
            }
        }
    }

    fn with_cookie(cookie: Option<&str>) -> RequestContext {
        let headers: Vec<(&str, &str)> = cookie.map(|c| ("cookie", c)).into_iter().collect();
        RequestContext::new(headers, Vec::<(String, String)>::new())
    }

    #[tokio::test]
    async fn test_missing_cookie_skips_verifier() {
        let verifier = CountingVerifier {
            calls: AtomicUsize::new(0),
            accept: true,
        };
        let result = authenticate(&verifier, Uuid::new_v4(), &with_cookie(None), "u1").await;
        assert_eq!(result, Err(AuthError::MissingCredentials));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_verifier_called_once() {
        let verifier = CountingVerifier {
            calls: AtomicUsize::new(0),
            accept: true,
        };
        let identity = authenticate(&verifier, Uuid::new_v4(), &with_cookie(Some("s=1")), "u1")
            .await
            .unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_surfaced_without_retry() {
        let verifier = CountingVerifier {
            calls: AtomicUsize::new(0),
            accept: false,
        };
        let result = authenticate(&verifier, Uuid::new_v4(), &with_cookie(Some("s=1")), "u1").await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }
}
