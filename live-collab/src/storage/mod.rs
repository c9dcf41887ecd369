//! Document store adapter.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  fetch / store   ┌───────────────┐  project_page  ┌──────────────────┐
//! │ Multiplexer │ ───────────────► │ DocumentStore │ ─────────────► │ ProjectPageBackend│
//! └─────────────┘                  └───────┬───────┘                └──────────────────┘
//!                                          │ anything else
//!                                          ▼
//!                                  ┌───────────────┐
//!                                  │ generic       │
//!                                  │ backend       │
//!                                  └───────────────┘
//! ```
//!
//! Backends report failures; the adapter logs and absorbs them so a storage
//! outage never tears down a live session. A failed fetch loads an empty
//! document, a failed store keeps the in-memory state for the next flush.

pub mod page;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::{ApiError, ContentApi};
use crate::context::{DocumentId, DocumentType, RequestContext};

pub use page::ProjectPageBackend;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid document type {0} provided")]
    UnsupportedDocumentType(String),
}

/// One storage code path for a family of documents.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Last persisted state, `None` for a document never stored.
    async fn fetch(
        &self,
        id: &DocumentId,
        context: &RequestContext,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    async fn store(
        &self,
        id: &DocumentId,
        context: &RequestContext,
        state: &[u8],
    ) -> Result<(), StoreError>;
}

/// Generic backend for deployments that only serve project pages.
pub struct UnsupportedDocuments;

#[async_trait]
impl DocumentBackend for UnsupportedDocuments {
    async fn fetch(
        &self,
        _id: &DocumentId,
        context: &RequestContext,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Err(unsupported(context))
    }

    async fn store(
        &self,
        _id: &DocumentId,
        context: &RequestContext,
        _state: &[u8],
    ) -> Result<(), StoreError> {
        Err(unsupported(context))
    }
}

fn unsupported(context: &RequestContext) -> StoreError {
    let kind = context
        .document_type()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "<none>".to_string());
    StoreError::UnsupportedDocumentType(kind)
}

/// Dispatches fetch/store by document classification.
pub struct DocumentStore {
    pages: Arc<dyn DocumentBackend>,
    documents: Arc<dyn DocumentBackend>,
}

impl DocumentStore {
    pub fn new(pages: Arc<dyn DocumentBackend>, documents: Arc<dyn DocumentBackend>) -> Self {
        Self { pages, documents }
    }

    /// Project pages through the content API, nothing else.
    pub fn with_content_api(api: ContentApi) -> Self {
        Self::new(
            Arc::new(ProjectPageBackend::new(api)),
            Arc::new(UnsupportedDocuments),
        )
    }

    fn backend_for(&self, context: &RequestContext) -> &dyn DocumentBackend {
        match context.document_type() {
            Some(DocumentType::ProjectPage) => self.pages.as_ref(),
            _ => self.documents.as_ref(),
        }
    }

    /// Load a document; never fails, errors load as an empty document.
    pub async fn fetch(&self, id: &DocumentId, context: &RequestContext) -> Option<Vec<u8>> {
        match self.backend_for(context).fetch(id, context).await {
            Ok(Some(state)) if !state.is_empty() => {
                log::debug!("Fetched {} bytes for document {id}", state.len());
                Some(state)
            }
            Ok(_) => None,
            Err(e) => {
                log::error!("Error in fetching document {id}: {e}");
                None
            }
        }
    }

    /// Persist a document; errors are logged and swallowed.
    pub async fn store(&self, id: &DocumentId, context: &RequestContext, state: &[u8]) {
        match self.backend_for(context).store(id, context, state).await {
            Ok(()) => log::info!("Stored document {id} ({} bytes)", state.len()),
            Err(e) => log::error!("Error in updating document {id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        label: &'static str,
        fail: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DocumentBackend for Recording {
        async fn fetch(
            &self,
            _id: &DocumentId,
            _context: &RequestContext,
        ) -> Result<Option<Vec<u8>>, StoreError> {
            self.calls.lock().unwrap().push(self.label);
            if self.fail {
                return Err(StoreError::MissingParameter("projectId"));
            }
            Ok(Some(vec![1, 2, 3]))
        }

        async fn store(
            &self,
            _id: &DocumentId,
            _context: &RequestContext,
            _state: &[u8],
        ) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(self.label);
            if self.fail {
                return Err(StoreError::MissingParameter("projectId"));
            }
            Ok(())
        }
    }

    fn context(document_type: &str) -> RequestContext {
        RequestContext::new(
            [("cookie", "s=1")],
            [("documentType", document_type)],
        )
    }

    #[tokio::test]
    async fn test_dispatch_by_classification() {
        let pages = Arc::new(Recording {
            label: "pages",
            ..Default::default()
        });
        let documents = Arc::new(Recording {
            label: "documents",
            ..Default::default()
        });
        let store = DocumentStore::new(pages.clone(), documents.clone());
        let id = DocumentId::new("d1");

        store.fetch(&id, &context("project_page")).await;
        store.fetch(&id, &context("wiki")).await;
        store.store(&id, &context("wiki"), &[9]).await;

        assert_eq!(*pages.calls.lock().unwrap(), vec!["pages"]);
        assert_eq!(*documents.calls.lock().unwrap(), vec!["documents", "documents"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_yields_none() {
        let failing = Arc::new(Recording {
            label: "pages",
            fail: true,
            ..Default::default()
        });
        let store = DocumentStore::new(failing.clone(), Arc::new(UnsupportedDocuments));
        let fetched = store
            .fetch(&DocumentId::new("d1"), &context("project_page"))
            .await;
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let failing = Arc::new(Recording {
            label: "pages",
            fail: true,
            ..Default::default()
        });
        let store = DocumentStore::new(failing.clone(), Arc::new(UnsupportedDocuments));
        store
            .store(&DocumentId::new("d1"), &context("project_page"), &[1])
            .await;
        assert_eq!(failing.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_documents_load_empty() {
        let store = DocumentStore::new(
            Arc::new(UnsupportedDocuments),
            Arc::new(UnsupportedDocuments),
        );
        assert!(store
            .fetch(&DocumentId::new("d1"), &context("wiki"))
            .await
            .is_none());
    }
}
