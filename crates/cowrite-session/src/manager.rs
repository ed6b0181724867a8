//! Connection manager - one replicated session per document

use crate::{ManagerConfig, SessionResult};
use cowrite_core::{DocumentId, SharedDocument};
use cowrite_storage::DocumentCache;
use cowrite_transport::{Awareness, Connector, Endpoint, SessionTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`ConnectionManager::open`]
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub token: Option<String>,
    /// Connect right away; otherwise the caller decides when
    pub auto_connect: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            token: None,
            auto_connect: true,
        }
    }
}

/// A document handle, its optional cache and its transport
pub struct Session {
    document_id: DocumentId,
    token: Option<String>,
    doc: Arc<SharedDocument>,
    transport: Arc<SessionTransport>,
    cache: Option<DocumentCache>,
    closed: AtomicBool,
}

impl Session {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        self.transport.awareness()
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the transport, the cache and the document, in that order.
    ///
    /// Every step runs even if an earlier one fails; failures are logged.
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transport.destroy().await;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.destroy().await {
                warn!(doc_id = %self.document_id, error = %e, "Failed to release document cache");
            }
        }

        self.doc.destroy();
        info!(doc_id = %self.document_id, "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("document_id", &self.document_id)
            .field("status", &self.transport.status())
            .field("cache", &self.cache.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds sessions from a shared configuration and connector
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Open a session for `document_id`.
    ///
    /// Cache problems degrade the session to non-persistent; only a relay
    /// endpoint that cannot be addressed fails the open, after releasing
    /// whatever was already built.
    pub async fn open(&self, document_id: DocumentId, options: OpenOptions) -> SessionResult<Session> {
        let doc = Arc::new(SharedDocument::new(document_id.clone()));
        let cache = self.attach_cache(&doc).await;

        let endpoint = match Endpoint::new(&self.config.relay_url, document_id.clone(), options.token.clone()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(doc_id = %document_id, error = %e, "Failed to set up session transport");
                if let Some(cache) = &cache {
                    if let Err(e) = cache.destroy().await {
                        warn!(doc_id = %document_id, error = %e, "Failed to release document cache");
                    }
                }
                doc.destroy();
                return Err(e.into());
            }
        };

        let transport = Arc::new(SessionTransport::new(
            endpoint,
            self.connector.clone(),
            doc.clone(),
            self.config.transport.clone(),
        ));
        if options.auto_connect {
            transport.connect();
        }

        info!(
            doc_id = %document_id,
            cache = cache.is_some(),
            auto_connect = options.auto_connect,
            "Session opened"
        );

        Ok(Session {
            document_id,
            token: options.token,
            doc,
            transport,
            cache,
            closed: AtomicBool::new(false),
        })
    }

    /// Close `session`; see [`Session::close`]
    pub async fn close(&self, session: &Session) {
        session.close().await;
    }

    async fn attach_cache(&self, doc: &Arc<SharedDocument>) -> Option<DocumentCache> {
        let backend = self.config.cache.as_ref()?;

        let store = match backend.open() {
            Ok(store) => store,
            Err(e) => {
                warn!(doc_id = %doc.id(), error = %e, "Local cache unavailable; continuing without it");
                return None;
            }
        };

        let cache = DocumentCache::attach(store, doc.clone(), self.config.cache_options.clone());
        match tokio::time::timeout(self.config.cache_sync_timeout, cache.when_synced()).await {
            Ok(Ok(())) => debug!(doc_id = %doc.id(), key = cache.key(), "Cache loaded"),
            Ok(Err(e)) => warn!(doc_id = %doc.id(), error = %e, "Cache failed to load"),
            Err(_) => warn!(doc_id = %doc.id(), "Timed out waiting for cache load"),
        }
        Some(cache)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish()
    }
}
