//! Relay endpoint addressing

use crate::{TransportError, TransportResult};
use cowrite_core::DocumentId;
use url::Url;

const SCHEMES: &[&str] = &["ws", "wss", "memory"];

/// Where a document's session connects: `{relay}/{document_id}?token=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
    document_id: DocumentId,
    token: Option<String>,
}

impl Endpoint {
    pub fn new(relay_url: &str, document_id: DocumentId, token: Option<String>) -> TransportResult<Self> {
        let base = Url::parse(relay_url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", relay_url, e)))?;

        if !SCHEMES.contains(&base.scheme()) {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidEndpoint(relay_url.to_string()));
        }

        Ok(Self {
            base,
            document_id,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn scheme(&self) -> &str {
        self.base.scheme()
    }

    /// Full URL of the room, including the access token
    pub fn url(&self) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(self.document_id.as_str());
        }
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }
}

impl std::fmt::Display for Endpoint {
    /// Never prints the token
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(self.document_id.as_str());
        }
        write!(f, "{}", url)
    }
}
