//! Typed per-capability wrappers over the request broker.
//!
//! These are advisory features: every failure is swallowed into a neutral
//! "no result" value so a missing or sick language server never breaks the
//! caller's control flow.

use crate::broker::LspBroker;
use crate::session::SessionId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Canonical location shape every goto-style response is normalized to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationLink {
    target_uri: String,
    target_selection_range: Range,
}

/// The three shapes servers answer goto-style requests with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GotoResponse {
    Scalar(Location),
    Array(Vec<Location>),
    Links(Vec<LocationLink>),
}

/// Normalize a goto-style response into the canonical location array.
fn normalize_locations(value: Value) -> Vec<Location> {
    if value.is_null() {
        return Vec::new();
    }
    match serde_json::from_value::<GotoResponse>(value) {
        Ok(GotoResponse::Scalar(location)) => vec![location],
        Ok(GotoResponse::Array(locations)) => locations,
        Ok(GotoResponse::Links(links)) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
        Err(err) => {
            debug!("unrecognized location response shape: {err}");
            Vec::new()
        }
    }
}

/// Flatten a null / bare-array / `{items: [...]}` response to its items.
fn value_to_items(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn text_document_position(uri: &str, position: Position) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": position,
    })
}

impl LspBroker {
    async fn query(&self, session_id: &SessionId, method: &str, params: Value) -> Option<Value> {
        match self.send_request(session_id, method, params).await {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(session = %session_id, method, "query failed: {err}");
                None
            }
        }
    }

    async fn goto(&self, session_id: &SessionId, method: &str, uri: &str, position: Position) -> Vec<Location> {
        match self
            .query(session_id, method, text_document_position(uri, position))
            .await
        {
            Some(value) => normalize_locations(value),
            None => Vec::new(),
        }
    }

    /// Hover text at a position; `None` when unavailable for any reason.
    pub async fn hover(&self, session_id: &SessionId, uri: &str, position: Position) -> Option<Value> {
        self.query(
            session_id,
            "textDocument/hover",
            text_document_position(uri, position),
        )
        .await
        .filter(|value| !value.is_null())
    }

    pub async fn definition(&self, session_id: &SessionId, uri: &str, position: Position) -> Vec<Location> {
        self.goto(session_id, "textDocument/definition", uri, position)
            .await
    }

    pub async fn implementation(&self, session_id: &SessionId, uri: &str, position: Position) -> Vec<Location> {
        self.goto(session_id, "textDocument/implementation", uri, position)
            .await
    }

    pub async fn references(
        &self,
        session_id: &SessionId,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> Vec<Location> {
        let params = json!({
            "textDocument": { "uri": uri },
            "position": position,
            "context": { "includeDeclaration": include_declaration },
        });
        let value = self
            .query(session_id, "textDocument/references", params)
            .await;
        match value {
            Some(Value::Array(locations)) => locations
                .into_iter()
                .filter_map(|location| serde_json::from_value(location).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub async fn document_symbols(&self, session_id: &SessionId, uri: &str) -> Vec<Value> {
        let params = json!({ "textDocument": { "uri": uri } });
        self.query(session_id, "textDocument/documentSymbol", params)
            .await
            .map(value_to_items)
            .unwrap_or_default()
    }

    pub async fn workspace_symbols(&self, session_id: &SessionId, query: &str) -> Vec<Value> {
        let params = json!({ "query": query });
        self.query(session_id, "workspace/symbol", params)
            .await
            .map(value_to_items)
            .unwrap_or_default()
    }

    /// First step of the call-hierarchy protocol; the returned items feed
    /// [`incoming_calls`](Self::incoming_calls) / [`outgoing_calls`](Self::outgoing_calls).
    pub async fn prepare_call_hierarchy(
        &self,
        session_id: &SessionId,
        uri: &str,
        position: Position,
    ) -> Vec<Value> {
        self.query(
            session_id,
            "textDocument/prepareCallHierarchy",
            text_document_position(uri, position),
        )
        .await
        .map(value_to_items)
        .unwrap_or_default()
    }

    pub async fn incoming_calls(&self, session_id: &SessionId, item: Value) -> Vec<Value> {
        self.query(
            session_id,
            "callHierarchy/incomingCalls",
            json!({ "item": item }),
        )
        .await
        .map(value_to_items)
        .unwrap_or_default()
    }

    pub async fn outgoing_calls(&self, session_id: &SessionId, item: Value) -> Vec<Value> {
        self.query(
            session_id,
            "callHierarchy/outgoingCalls",
            json!({ "item": item }),
        )
        .await
        .map(value_to_items)
        .unwrap_or_default()
    }

    /// Completion items at a position, flattened out of either the bare-list
    /// or the `{isIncomplete, items}` response shape.
    pub async fn completion(&self, session_id: &SessionId, uri: &str, position: Position) -> Vec<Value> {
        self.query(
            session_id,
            "textDocument/completion",
            text_document_position(uri, position),
        )
        .await
        .map(value_to_items)
        .unwrap_or_default()
    }
}
