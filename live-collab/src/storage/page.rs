//! Project page backend.
//!
//! Pages live in the content API as a binary description scoped by
//! workspace and project.

use async_trait::async_trait;

use super::{DocumentBackend, StoreError};
use crate::api::{ContentApi, PagePath};
use crate::context::{DocumentId, RequestContext};

/// Project pages, stored as the page's binary description.
pub struct ProjectPageBackend {
    api: ContentApi,
}

impl ProjectPageBackend {
    pub fn new(api: ContentApi) -> Self {
        Self { api }
    }
}

/// Workspace, project and cookie every page request needs.
fn page_scope<'a>(
    context: &'a RequestContext,
) -> Result<(&'a str, &'a str, &'a str), StoreError> {
    let workspace_slug = context
        .workspace_slug()
        .ok_or(StoreError::MissingParameter("workspaceSlug"))?;
    let project_id = context
        .project_id()
        .ok_or(StoreError::MissingParameter("projectId"))?;
    let cookie = context
        .cookie()
        .ok_or(StoreError::MissingParameter("cookie"))?;
    Ok((workspace_slug, project_id, cookie))
}

#[async_trait]
impl DocumentBackend for ProjectPageBackend {
    async fn fetch(
        &self,
        id: &DocumentId,
        context: &RequestContext,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let (workspace_slug, project_id, cookie) = page_scope(context)?;
        let page = PagePath {
            workspace_slug,
            project_id,
            page_id: id.as_str(),
        };
        let state = self.api.fetch_page_description(page, cookie).await?;
        Ok((!state.is_empty()).then_some(state))
    }

    async fn store(
        &self,
        id: &DocumentId,
        context: &RequestContext,
        state: &[u8],
    ) -> Result<(), StoreError> {
        let (workspace_slug, project_id, cookie) = page_scope(context)?;
        let page = PagePath {
            workspace_slug,
            project_id,
            page_id: id.as_str(),
        };
        self.api.update_page_description(page, state, cookie).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_scope_requires_all_parts() {
        let ctx = RequestContext::new(
            [("cookie", "s=1")],
            [("workspaceSlug", "acme")],
        );
        assert!(matches!(
            page_scope(&ctx),
            Err(StoreError::MissingParameter("projectId"))
        ));

        let ctx = RequestContext::new(
            Vec::<(String, String)>::new(),
            [("workspaceSlug", "acme"), ("projectId", "p1")],
        );
        assert!(matches!(
            page_scope(&ctx),
            Err(StoreError::MissingParameter("cookie"))
        ));
    }

    #[tokio::test]
    async fn test_missing_scope_makes_no_request() {
        // Unroutable base URL: a request would fail with an API error instead.
        let backend = ProjectPageBackend::new(ContentApi::new("http://127.0.0.1:9").unwrap());
        let ctx = RequestContext::new([("cookie", "s=1")], [("documentType", "project_page")]);
        let result = backend.fetch(&DocumentId::new("pg"), &ctx).await;
        assert!(matches!(
            result,
            Err(StoreError::MissingParameter("workspaceSlug"))
        ));
    }
}
