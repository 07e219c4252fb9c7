#![deny(clippy::print_stdout, clippy::print_stderr)]

mod broker;
pub mod config;
pub mod error;
mod events;
mod pending;
pub mod protocol;
mod queries;
pub mod session;
pub mod supervisor;

pub use broker::DiagnosticsCallback;
pub use broker::LspBroker;
pub use broker::NotificationCallback;
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use error::Result;
pub use events::Subscription;
pub use protocol::IncomingMessage;
pub use protocol::ResponseError;
pub use queries::Location;
pub use queries::Position;
pub use queries::Range;
pub use session::SessionId;
pub use session::SessionInfo;
pub use supervisor::DownloadPhase;
pub use supervisor::DownloadProgress;
pub use supervisor::ProcessSupervisor;
pub use supervisor::ServerStatus;
