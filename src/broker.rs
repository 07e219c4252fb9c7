//! The broker: session lifecycle, request correlation, inbound dispatch,
//! and document synchronization.

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::error::Result;
use crate::events::SubscriberSet;
use crate::events::Subscription;
use crate::events::deliver;
use crate::pending::PendingRequests;
use crate::pending::RequestOutcome;
use crate::protocol;
use crate::protocol::IncomingMessage;
use crate::protocol::JSONRPC_VERSION;
use crate::protocol::OutgoingNotification;
use crate::protocol::OutgoingRequest;
use crate::protocol::PUBLISH_DIAGNOSTICS_METHOD;
use crate::session::ServerKey;
use crate::session::Session;
use crate::session::SessionId;
use crate::session::SessionInfo;
use crate::session::SessionRegistry;
use crate::supervisor::DownloadProgress;
use crate::supervisor::ProcessSupervisor;
use crate::supervisor::ServerStatus;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Diagnostics subscriber: `(document uri, diagnostics)`.
pub type DiagnosticsCallback = dyn Fn(&str, &[Value]) + Send + Sync;
/// Generic notification subscriber: `(method, params)`.
pub type NotificationCallback = dyn Fn(&str, &Value) + Send + Sync;

#[derive(Debug, Deserialize)]
struct PublishDiagnosticsPayload {
    uri: String,
    #[serde(default)]
    diagnostics: Vec<Value>,
}

/// Client-side broker for out-of-process language-analysis servers.
///
/// One instance per application, constructed at the composition root and
/// cloned wherever a handle is needed (clones share state). The owner of the
/// supervisor's inbound event stream must feed every raw message into
/// [`handle_message`](Self::handle_message).
#[derive(Clone)]
pub struct LspBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    pending: PendingRequests,
    registry: Mutex<SessionRegistry>,
    /// Serializes start attempts per (language, root); see [`LspBroker::start_server`].
    start_locks: Mutex<HashMap<ServerKey, Arc<Mutex<()>>>>,
    diagnostics_subs: SubscriberSet<DiagnosticsCallback>,
    notification_subs: SubscriberSet<NotificationCallback>,
}

impl LspBroker {
    pub fn new(config: BrokerConfig, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                supervisor,
                pending: PendingRequests::new(),
                registry: Mutex::new(SessionRegistry::default()),
                start_locks: Mutex::new(HashMap::new()),
                diagnostics_subs: SubscriberSet::new(),
                notification_subs: SubscriberSet::new(),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start (or reuse) the session for `(language, root)`.
    ///
    /// Reuse increments the reference count and cancels any pending idle
    /// cleanup. A fresh start checks availability, spawns through the
    /// supervisor, runs the initialize handshake, and registers the session
    /// with a reference count of 1. Start attempts for the same key are
    /// serialized so two concurrent callers can never spawn two processes.
    pub async fn start_server(&self, language: &str, root: &Path) -> Result<SessionId> {
        let key = ServerKey::new(language, root);
        let start_lock = self.start_lock_for(&key).await;
        let _guard = start_lock.lock().await;

        if let Some(id) = self.acquire_existing(&key).await {
            debug!(session = %id, language, "reusing existing session");
            return Ok(id);
        }

        let status = self
            .inner
            .supervisor
            .status(language)
            .await
            .map_err(BrokerError::supervisor)?;
        if !status.available {
            if status.can_auto_install {
                return Err(BrokerError::InstallRequired {
                    language: language.to_string(),
                });
            }
            return Err(BrokerError::NotInstalled {
                language: language.to_string(),
            });
        }

        let session_id = self
            .inner
            .supervisor
            .start(language, root)
            .await
            .map_err(|err| BrokerError::StartFailed {
                language: language.to_string(),
                reason: err.to_string(),
            })?;

        // Register before the handshake so the initialize response can be
        // routed; initialized stays false until the handshake completes.
        {
            let mut registry = self.inner.registry.lock().await;
            registry.insert(Session::new(
                session_id.clone(),
                language.to_string(),
                root.to_path_buf(),
            ));
        }

        match self.initialize_session(&session_id, language, root).await {
            Ok(()) => {
                let mut registry = self.inner.registry.lock().await;
                if let Some(session) = registry.get_mut(&session_id) {
                    session.initialized = true;
                }
                info!(session = %session_id, language, root = %root.display(), "session started");
                Ok(session_id)
            }
            Err(err) => {
                warn!(session = %session_id, language, "initialize failed: {err}");
                if let Err(stop_err) = self.inner.supervisor.stop(&session_id).await {
                    warn!(session = %session_id, "failed to stop after bad handshake: {stop_err}");
                }
                self.inner.registry.lock().await.remove(&session_id);
                Err(err)
            }
        }
    }

    async fn acquire_existing(&self, key: &ServerKey) -> Option<SessionId> {
        let mut registry = self.inner.registry.lock().await;
        let id = registry.id_for_key(key)?.clone();
        let session = registry.get_mut(&id)?;
        session.cancel_idle_cleanup();
        session.ref_count += 1;
        Some(id)
    }

    async fn initialize_session(
        &self,
        session_id: &SessionId,
        language: &str,
        root: &Path,
    ) -> Result<()> {
        let root_uri = uri_from_root(root);
        let params = json!({
            "processId": Value::Null,
            "rootUri": root_uri,
            "workspaceFolders": [{ "uri": root_uri, "name": "workspace" }],
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": false },
                    "publishDiagnostics": { "relatedInformation": true },
                    "hover": { "contentFormat": ["plaintext", "markdown"] },
                    "definition": { "linkSupport": true },
                    "implementation": { "linkSupport": true },
                    "references": {},
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                    "callHierarchy": {},
                    "completion": { "completionItem": { "snippetSupport": false } },
                },
                "workspace": { "symbol": {}, "workspaceFolders": true },
            },
            "initializationOptions": self
                .inner
                .config
                .initialization_options_for(language)
                .cloned()
                .unwrap_or(Value::Null),
        });

        self.request_with_timeout(
            session_id,
            "initialize",
            params,
            self.inner.config.initialize_timeout(),
        )
        .await?;
        self.send_notification(session_id, "initialized", json!({}))
            .await?;
        Ok(())
    }

    /// Stop a session, or just release one reference when others remain.
    pub async fn stop_server(&self, session_id: &SessionId, force: bool) -> Result<()> {
        let session = {
            let mut registry = self.inner.registry.lock().await;
            let session = registry
                .get_mut(session_id)
                .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
            if !force && session.ref_count > 1 {
                session.ref_count -= 1;
                debug!(session = %session_id, ref_count = session.ref_count, "released reference");
                return Ok(());
            }
            // Commit: once the session leaves the registry, a concurrent
            // start for the same key falls through to the spawn path
            // instead of reacquiring a dying session.
            registry.remove(session_id)
        };
        if let Some(session) = session {
            self.teardown(&session).await;
        }
        Ok(())
    }

    /// Graceful shutdown sequence, then forced termination.
    /// Protocol failures are logged; the termination still proceeds.
    ///
    /// The session has already been removed from the registry. The key's
    /// start lock is held across the whole sequence so a replacement start
    /// for the same (language, root) waits until the old process is gone.
    async fn teardown(&self, session: &Session) {
        let key = ServerKey::new(&session.language, &session.root);
        let start_lock = self.start_lock_for(&key).await;
        let guard = start_lock.lock().await;

        let session_id = &session.id;
        match self
            .request_with_timeout(
                session_id,
                "shutdown",
                Value::Null,
                self.inner.config.shutdown_timeout(),
            )
            .await
        {
            Ok(_) => debug!(session = %session_id, "server acknowledged shutdown"),
            Err(err) => warn!(session = %session_id, "shutdown request failed: {err}"),
        }
        if let Err(err) = self.send_notification(session_id, "exit", Value::Null).await {
            warn!(session = %session_id, "exit notification failed: {err}");
        }
        if let Err(err) = self.inner.supervisor.stop(session_id).await {
            warn!(session = %session_id, "supervisor stop failed: {err}");
        }
        info!(session = %session_id, "session stopped");

        drop(guard);
        // Drop the key's lock entry unless another caller still holds a
        // clone; clones are only handed out under the map lock.
        let mut locks = self.inner.start_locks.lock().await;
        if let Some(entry) = locks.get(&key)
            && Arc::ptr_eq(entry, &start_lock)
            && Arc::strong_count(&start_lock) == 2
        {
            locks.remove(&key);
        }
    }

    async fn start_lock_for(&self, key: &ServerKey) -> Arc<Mutex<()>> {
        let mut locks = self.inner.start_locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Acquire one more reference, cancelling any pending idle cleanup in
    /// the same critical section.
    pub async fn increment_ref_count(&self, session_id: &SessionId) -> Result<u32> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
        session.cancel_idle_cleanup();
        session.ref_count += 1;
        Ok(session.ref_count)
    }

    /// Release one reference. Reaching zero schedules idle cleanup instead
    /// of stopping immediately, to tolerate rapid reacquire.
    pub async fn decrement_ref_count(&self, session_id: &SessionId) -> Result<u32> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
        session.ref_count = session.ref_count.saturating_sub(1);
        let count = session.ref_count;
        if count == 0 && session.idle_cleanup.is_none() {
            let broker = self.clone();
            let id = session_id.clone();
            let delay = self.inner.config.idle_cleanup_delay();
            debug!(session = %session_id, delay_ms = delay.as_millis() as u64, "scheduling idle cleanup");
            session.idle_cleanup = Some(tokio::spawn(async move {
                time::sleep(delay).await;
                broker.finish_idle_cleanup(&id).await;
            }));
        }
        Ok(count)
    }

    async fn finish_idle_cleanup(&self, session_id: &SessionId) {
        let session = {
            let mut registry = self.inner.registry.lock().await;
            let Some(session) = registry.get_mut(session_id) else {
                return;
            };
            // Take the handle first: `remove` aborts any stored handle,
            // and that handle is this very task.
            session.idle_cleanup = None;
            // Reacquired while the timer was firing; leave it alone.
            if session.ref_count > 0 {
                return;
            }
            registry.remove(session_id)
        };
        if let Some(session) = session {
            info!(session = %session_id, "idle cleanup elapsed");
            self.teardown(&session).await;
        }
    }

    pub async fn get_ref_count(&self, session_id: &SessionId) -> Result<u32> {
        let registry = self.inner.registry.lock().await;
        registry
            .get(session_id)
            .map(|session| session.ref_count)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))
    }

    /// Snapshot of the session for `(language, root)`, if one is live.
    pub async fn get_server(&self, language: &str, root: &Path) -> Option<SessionInfo> {
        let registry = self.inner.registry.lock().await;
        let id = registry.id_for_key(&ServerKey::new(language, root))?.clone();
        registry.get(&id).map(Session::info)
    }

    /// Tear the whole broker down: reject every outstanding request, then
    /// force-stop every session.
    pub async fn shutdown(&self) {
        let rejected = self.inner.pending.reject_all().await;
        if !rejected.is_empty() {
            info!(count = rejected.len(), "rejected outstanding requests at shutdown");
        }
        let sessions: Vec<Session> = {
            let mut registry = self.inner.registry.lock().await;
            let ids = registry.ids();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for session in sessions {
            self.teardown(&session).await;
        }
    }

    // =========================================================================
    // Request/notification broker
    // =========================================================================

    /// Send a correlated request and await its response, bounded by the
    /// configured request timeout.
    pub async fn send_request(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        self.request_with_timeout(session_id, method, params, self.inner.config.request_timeout())
            .await
    }

    async fn request_with_timeout(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (id, rx) = self.inner.pending.register(method).await;
        let text = serde_json::to_string(&OutgoingRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        })?;

        if let Err(err) = self.inner.supervisor.send_raw(session_id, &text).await {
            self.inner.pending.discard(id).await;
            return Err(BrokerError::supervisor(err));
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(RequestOutcome::Result(value))) => Ok(value),
            Ok(Ok(RequestOutcome::Error(error))) => Err(BrokerError::ServerError {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(Ok(RequestOutcome::ShuttingDown)) => Err(BrokerError::ShuttingDown),
            Ok(Err(_)) => {
                self.inner.pending.discard(id).await;
                Err(BrokerError::ConnectionClosed)
            }
            Err(_) => {
                // Abandon locally; a late reply will be dropped as unmatched.
                self.inner.pending.discard(id).await;
                Err(BrokerError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send an uncorrelated notification; nothing is awaited beyond the write.
    pub async fn send_notification(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Value,
    ) -> Result<()> {
        let text = serde_json::to_string(&OutgoingNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        })?;
        self.inner
            .supervisor
            .send_raw(session_id, &text)
            .await
            .map_err(BrokerError::supervisor)
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    /// Entry point for the supervisor's inbound event stream. Malformed or
    /// unroutable messages are logged and dropped, never fatal.
    pub async fn handle_message(&self, session_id: &SessionId, raw: &str) {
        match protocol::decode_message(raw) {
            Ok(IncomingMessage::Response { id, result, error }) => {
                let outcome = match error {
                    Some(error) => RequestOutcome::Error(error),
                    None => RequestOutcome::Result(result.unwrap_or(Value::Null)),
                };
                if !self.inner.pending.complete(id, outcome).await {
                    debug!(session = %session_id, id, "dropping response with no pending request");
                }
            }
            Ok(IncomingMessage::Notification { method, params }) => {
                self.dispatch_notification(session_id, &method, params);
            }
            Err(err) => {
                warn!(session = %session_id, "discarding inbound message: {err}");
            }
        }
    }

    fn dispatch_notification(&self, session_id: &SessionId, method: &str, params: Value) {
        for callback in self.inner.notification_subs.snapshot() {
            deliver("notification", || callback(method, &params));
        }

        if method == PUBLISH_DIAGNOSTICS_METHOD {
            match serde_json::from_value::<PublishDiagnosticsPayload>(params) {
                Ok(payload) => {
                    debug!(
                        session = %session_id,
                        uri = %payload.uri,
                        count = payload.diagnostics.len(),
                        "publishing diagnostics"
                    );
                    for callback in self.inner.diagnostics_subs.snapshot() {
                        deliver("diagnostics", || {
                            callback(&payload.uri, &payload.diagnostics)
                        });
                    }
                }
                Err(err) => {
                    warn!(session = %session_id, "malformed diagnostics payload: {err}");
                }
            }
        }
    }

    /// Subscribe to `(uri, diagnostics)` pushes.
    pub fn on_diagnostics(&self, callback: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Subscription {
        self.inner.diagnostics_subs.insert(Arc::new(callback))
    }

    /// Subscribe to every server-initiated notification as `(method, params)`.
    pub fn on_notification(&self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> Subscription {
        self.inner.notification_subs.insert(Arc::new(callback))
    }

    // =========================================================================
    // Document sync
    // =========================================================================

    /// Open a document at version 1 and send its full text.
    pub async fn open_document(
        &self,
        session_id: &SessionId,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        let session = initialized_session(&mut registry, session_id)?;
        session.documents.insert(uri.to_string(), 1);
        let params = json!({
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": 1,
                "text": text,
            }
        });
        // The registry lock is held across the send so didOpen/didChange
        // never reorder relative to the versions they carry.
        self.send_notification(session_id, "textDocument/didOpen", params)
            .await?;
        debug!(session = %session_id, uri, "opened document");
        Ok(())
    }

    /// Bump the document version by exactly one and send the full new text.
    pub async fn change_document(&self, session_id: &SessionId, uri: &str, text: &str) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        let session = initialized_session(&mut registry, session_id)?;
        let version = session
            .documents
            .entry(uri.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        let version = *version;
        let params = json!({
            "textDocument": { "uri": uri, "version": version },
            "contentChanges": [{ "text": text }],
        });
        self.send_notification(session_id, "textDocument/didChange", params)
            .await?;
        debug!(session = %session_id, uri, version, "changed document");
        Ok(())
    }

    /// Drop version tracking and tell the server the document is closed.
    /// A no-op when the session never finished initializing.
    pub async fn close_document(&self, session_id: &SessionId, uri: &str) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        let session = registry
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
        if !session.initialized {
            return Ok(());
        }
        session.documents.remove(uri);
        let params = json!({ "textDocument": { "uri": uri } });
        self.send_notification(session_id, "textDocument/didClose", params)
            .await?;
        debug!(session = %session_id, uri, "closed document");
        Ok(())
    }

    // =========================================================================
    // Supervisor pass-through
    // =========================================================================

    pub async fn get_server_status(&self, language: &str) -> Result<ServerStatus> {
        self.inner
            .supervisor
            .status(language)
            .await
            .map_err(BrokerError::supervisor)
    }

    pub async fn download_server(&self, language: &str) -> Result<PathBuf> {
        self.inner
            .supervisor
            .download(language)
            .await
            .map_err(BrokerError::supervisor)
    }

    /// Forward the supervisor's download-progress stream to a callback.
    pub fn on_download_progress(
        &self,
        callback: impl Fn(&DownloadProgress) + Send + Sync + 'static,
    ) -> Subscription {
        let mut events = self.inner.supervisor.subscribe_downloads();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => deliver("download progress", || callback(&event)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "download progress subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(move || forwarder.abort())
    }
}

fn initialized_session<'a>(
    registry: &'a mut SessionRegistry,
    session_id: &SessionId,
) -> Result<&'a mut Session> {
    let session = registry
        .get_mut(session_id)
        .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
    if !session.initialized {
        return Err(BrokerError::NotInitialized(session_id.clone()));
    }
    Ok(session)
}

fn uri_from_root(root: &Path) -> String {
    format!("file://{}", root.display())
}
