//! Seam to the external process supervisor.
//!
//! The supervisor owns everything the broker treats as out of scope:
//! spawning and killing server binaries, install checks, downloads, and the
//! raw byte transport. The broker only calls these operations and feeds the
//! supervisor's inbound event stream into [`crate::LspBroker::handle_message`].

use crate::session::SessionId;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Install/availability state of one language's server binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStatus {
    pub available: bool,
    pub installed: bool,
    pub can_auto_install: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Downloading,
    Extracting,
    Completed,
    Error,
}

/// One event on the supervisor's download-progress stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub language: String,
    pub phase: DownloadPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Abstract operations on the out-of-process supervisor.
///
/// Implementations report failures as opaque [`anyhow::Error`]s; the broker
/// maps them into its own taxonomy at the call sites.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Whether a server for this language can be started right now.
    async fn check_available(&self, language: &str) -> bool;

    /// Full install/availability status for one language.
    async fn status(&self, language: &str) -> anyhow::Result<ServerStatus>;

    /// Download and install the server binary, reporting progress on the
    /// stream returned by [`subscribe_downloads`](Self::subscribe_downloads).
    async fn download(&self, language: &str) -> anyhow::Result<PathBuf>;

    /// Spawn a server process for (language, root) and return its session id.
    async fn start(&self, language: &str, root: &Path) -> anyhow::Result<SessionId>;

    /// Terminate the process behind a session.
    async fn stop(&self, session_id: &SessionId) -> anyhow::Result<()>;

    /// Write serialized protocol text to the session's transport.
    async fn send_raw(&self, session_id: &SessionId, text: &str) -> anyhow::Result<()>;

    /// Subscribe to download-progress events.
    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadProgress>;
}
