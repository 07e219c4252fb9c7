#![allow(dead_code)]

use lsp_broker::BrokerConfig;
use lsp_broker::DownloadProgress;
use lsp_broker::LspBroker;
use lsp_broker::ProcessSupervisor;
use lsp_broker::ServerStatus;
use lsp_broker::SessionId;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::broadcast;

/// One line of raw traffic the broker handed to the transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub session: SessionId,
    pub body: Value,
}

impl SentMessage {
    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<i64> {
        self.body.get("id").and_then(Value::as_i64)
    }

    pub fn params(&self) -> Value {
        self.body.get("params").cloned().unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct FakeState {
    starts: Vec<(String, PathBuf)>,
    stops: Vec<SessionId>,
    sent: Vec<SentMessage>,
    statuses: HashMap<String, ServerStatus>,
    next_session: u32,
    stop_delay: Option<Duration>,
}

/// In-memory supervisor: records everything, answers the initialize and
/// shutdown handshakes by looping canned responses back through
/// `handle_message`, and leaves every other request for the test to answer.
pub struct FakeSupervisor {
    state: Mutex<FakeState>,
    broker: OnceLock<LspBroker>,
    downloads: broadcast::Sender<DownloadProgress>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        let (downloads, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(FakeState::default()),
            broker: OnceLock::new(),
            downloads,
        }
    }

    pub fn attach(&self, broker: LspBroker) {
        let _ = self.broker.set(broker);
    }

    pub fn set_status(&self, language: &str, status: ServerStatus) {
        self.lock().statuses.insert(language.to_string(), status);
    }

    /// Make `stop` linger, exposing the teardown-in-progress window.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.lock().stop_delay = Some(delay);
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts.len()
    }

    pub fn stops(&self) -> Vec<SessionId> {
        self.lock().stops.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    /// Recorded requests (messages carrying an id) for one method.
    pub fn requests(&self, method: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.id().is_some() && m.method() == Some(method))
            .collect()
    }

    /// Recorded notifications (no id) for one method.
    pub fn notifications(&self, method: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.id().is_none() && m.method() == Some(method))
            .collect()
    }

    /// Feed a success response for a recorded request back to the broker.
    pub async fn respond(&self, session: &SessionId, id: i64, result: Value) {
        let broker = self.broker.get().expect("broker attached");
        let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        broker.handle_message(session, &reply.to_string()).await;
    }

    /// Feed an error response for a recorded request back to the broker.
    pub async fn respond_error(&self, session: &SessionId, id: i64, code: i64, message: &str) {
        let broker = self.broker.get().expect("broker attached");
        let reply = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        });
        broker.handle_message(session, &reply.to_string()).await;
    }

    pub fn emit_download(&self, event: DownloadProgress) {
        let _ = self.downloads.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn check_available(&self, language: &str) -> bool {
        self.status(language)
            .await
            .map(|status| status.available)
            .unwrap_or(false)
    }

    async fn status(&self, language: &str) -> anyhow::Result<ServerStatus> {
        Ok(self.lock().statuses.get(language).cloned().unwrap_or(ServerStatus {
            available: true,
            installed: true,
            can_auto_install: false,
            download_url: None,
        }))
    }

    async fn download(&self, _language: &str) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from("/tmp/fake-server"))
    }

    async fn start(&self, language: &str, root: &Path) -> anyhow::Result<SessionId> {
        let mut state = self.lock();
        state.next_session += 1;
        let id = SessionId::new(format!("session-{}", state.next_session));
        state.starts.push((language.to_string(), root.to_path_buf()));
        Ok(id)
    }

    async fn stop(&self, session_id: &SessionId) -> anyhow::Result<()> {
        let delay = self.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().stops.push(session_id.clone());
        Ok(())
    }

    async fn send_raw(&self, session_id: &SessionId, text: &str) -> anyhow::Result<()> {
        let body: Value = serde_json::from_str(text)?;
        let reply = {
            let mut state = self.lock();
            state.sent.push(SentMessage {
                session: session_id.clone(),
                body: body.clone(),
            });
            match (
                body.get("id").and_then(Value::as_i64),
                body.get("method").and_then(Value::as_str),
            ) {
                (Some(id), Some("initialize")) => {
                    Some(json!({ "jsonrpc": "2.0", "id": id, "result": { "capabilities": {} } }))
                }
                (Some(id), Some("shutdown")) => {
                    Some(json!({ "jsonrpc": "2.0", "id": id, "result": null }))
                }
                _ => None,
            }
        };
        if let Some(reply) = reply
            && let Some(broker) = self.broker.get()
        {
            broker.handle_message(session_id, &reply.to_string()).await;
        }
        Ok(())
    }

    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadProgress> {
        self.downloads.subscribe()
    }
}

/// Broker wired to a fresh fake supervisor.
pub fn broker_with(config: BrokerConfig) -> (Arc<FakeSupervisor>, LspBroker) {
    let supervisor = Arc::new(FakeSupervisor::new());
    let broker = LspBroker::new(config, supervisor.clone());
    supervisor.attach(broker.clone());
    (supervisor, broker)
}

pub fn default_broker() -> (Arc<FakeSupervisor>, LspBroker) {
    broker_with(BrokerConfig::default())
}

/// Let spawned tasks (idle cleanup, in-flight requests) run to quiescence.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll until `predicate` holds, yielding between checks so the condition
/// can make progress without letting the paused clock auto-advance.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
