//! External collaborators the session consults at its boundary
//!
//! Access resolution, document metadata and stylesheet injection belong to
//! the host application. The session only depends on these traits; the
//! static implementations serve tests, the demo and the terminal client.

use crate::{SessionError, SessionResult};
use async_trait::async_trait;
use cowrite_core::DocumentId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Edit,
}

/// Outcome of resolving a share token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareAccess {
    pub permission: Permission,
}

#[async_trait]
pub trait AccessResolver: Send + Sync {
    async fn resolve(&self, document_id: &DocumentId, token: &str) -> SessionResult<ShareAccess>;
}

/// Resolves every token to the same answer
#[derive(Debug, Clone)]
pub struct StaticAccess {
    outcome: Result<Permission, String>,
}

impl StaticAccess {
    pub fn granting(permission: Permission) -> Self {
        Self { outcome: Ok(permission) }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            outcome: Err(reason.into()),
        }
    }
}

impl Default for StaticAccess {
    fn default() -> Self {
        Self::granting(Permission::Edit)
    }
}

#[async_trait]
impl AccessResolver for StaticAccess {
    async fn resolve(&self, _document_id: &DocumentId, _token: &str) -> SessionResult<ShareAccess> {
        match &self.outcome {
            Ok(permission) => Ok(ShareAccess {
                permission: *permission,
            }),
            Err(reason) => Err(SessionError::Access(reason.clone())),
        }
    }
}

/// Descriptive fields shown alongside the document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, document_id: &DocumentId, token: Option<&str>) -> SessionResult<DocumentMetadata>;
}

/// Metadata from a fixed table; unknown documents are an error
#[derive(Debug, Default)]
pub struct StaticMetadata {
    documents: Mutex<HashMap<DocumentId, DocumentMetadata>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document_id: DocumentId, metadata: DocumentMetadata) {
        self.documents.lock().insert(document_id, metadata);
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch(&self, document_id: &DocumentId, _token: Option<&str>) -> SessionResult<DocumentMetadata> {
        self.documents
            .lock()
            .get(document_id)
            .cloned()
            .ok_or_else(|| SessionError::Metadata(format!("unknown document {}", document_id)))
    }
}

/// Where generated presence stylesheets go
pub trait StyleSink: Send + Sync {
    /// Install `css` under `id`, replacing any previous fragment with that id
    fn replace(&self, id: &str, css: &str);

    fn remove(&self, id: &str);
}

/// Keeps fragments in memory; the terminal client and tests read them back
#[derive(Debug, Default)]
pub struct MemoryStyleSink {
    fragments: Mutex<HashMap<String, String>>,
}

impl MemoryStyleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.fragments.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.fragments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.lock().is_empty()
    }
}

impl StyleSink for MemoryStyleSink {
    fn replace(&self, id: &str, css: &str) {
        self.fragments.lock().insert(id.to_string(), css.to_string());
    }

    fn remove(&self, id: &str) {
        self.fragments.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_access() {
        let doc = DocumentId::new("d").unwrap();
        let view = StaticAccess::granting(Permission::View);
        assert_eq!(view.resolve(&doc, "t").await.unwrap().permission, Permission::View);

        let failing = StaticAccess::failing("expired");
        assert!(matches!(failing.resolve(&doc, "t").await, Err(SessionError::Access(_))));
    }

    #[tokio::test]
    async fn test_static_metadata() {
        let source = StaticMetadata::new();
        let doc = DocumentId::new("d").unwrap();
        assert!(source.fetch(&doc, None).await.is_err());

        source.insert(doc.clone(), DocumentMetadata { title: Some("Plans".into()) });
        assert_eq!(source.fetch(&doc, None).await.unwrap().title.as_deref(), Some("Plans"));
    }
}
