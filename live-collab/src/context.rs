//! Request-scoped data captured when a connection is upgraded.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Query parameter carrying the document classification.
pub const DOCUMENT_TYPE_PARAM: &str = "documentType";
/// Query parameter carrying the document identity.
pub const DOCUMENT_ID_PARAM: &str = "documentId";
pub const WORKSPACE_SLUG_PARAM: &str = "workspaceSlug";
pub const PROJECT_ID_PARAM: &str = "projectId";

/// Unique key naming one collaboratively edited document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Classification selecting which storage backend handles a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentType {
    ProjectPage,
    Other(String),
}

impl DocumentType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "project_page" => Self::ProjectPage,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ProjectPage => "project_page",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Headers and query parameters of the upgrade request.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    headers: BTreeMap<String, String>,
    params: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new<H, P, K, V, K2, V2>(headers: H, params: P) -> Self
    where
        H: IntoIterator<Item = (K, V)>,
        P: IntoIterator<Item = (K2, V2)>,
        K: AsRef<str>,
        V: Into<String>,
        K2: Into<String>,
        V2: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The session cookie, if a non-empty one was sent.
    pub fn cookie(&self) -> Option<&str> {
        self.header("cookie").filter(|c| !c.trim().is_empty())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.param(DOCUMENT_ID_PARAM).map(DocumentId::new)
    }

    pub fn document_type(&self) -> Option<DocumentType> {
        self.param(DOCUMENT_TYPE_PARAM).map(DocumentType::parse)
    }

    pub fn workspace_slug(&self) -> Option<&str> {
        self.param(WORKSPACE_SLUG_PARAM)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.param(PROJECT_ID_PARAM)
    }
}

/// A verified caller bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
    /// Read-only sessions receive updates but cannot modify the document.
    pub read_only: bool,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(cookie: Option<&str>) -> RequestContext {
        let headers: Vec<(&str, &str)> = cookie.map(|c| ("Cookie", c)).into_iter().collect();
        RequestContext::new(
            headers,
            [
                ("documentType", "project_page"),
                ("documentId", "page-1"),
                ("workspaceSlug", "acme"),
                ("projectId", ""),
            ],
        )
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let ctx = context(Some("session=abc"));
        assert_eq!(ctx.cookie(), Some("session=abc"));
        assert_eq!(ctx.header("COOKIE"), Some("session=abc"));
    }

    #[test]
    fn test_blank_cookie_is_missing() {
        assert_eq!(context(Some("  ")).cookie(), None);
        assert_eq!(context(None).cookie(), None);
    }

    #[test]
    fn test_params() {
        let ctx = context(None);
        assert_eq!(ctx.document_type(), Some(DocumentType::ProjectPage));
        assert_eq!(ctx.document_id(), Some(DocumentId::new("page-1")));
        assert_eq!(ctx.workspace_slug(), Some("acme"));
        // Empty values count as absent
        assert_eq!(ctx.project_id(), None);
    }

    #[test]
    fn test_document_type_parse() {
        assert_eq!(DocumentType::parse("project_page"), DocumentType::ProjectPage);
        let other = DocumentType::parse("wiki_page");
        assert_eq!(other, DocumentType::Other("wiki_page".to_string()));
        assert_eq!(other.as_str(), "wiki_page");
    }
}
