//! Wire types of the router contract.
//!
//! Everything here crosses the router's streams as JSON through the
//! default codec; payloads stay opaque maps so applications can route
//! whatever they like.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sender id the router uses for its own heartbeats.
pub const ROUTER_SENDER_ID: &str = "router";

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMessageKind {
    P2pRequest,
    P2pResponse,
    Heartbeat,
    Broadcast,
    Unicast,
    Multicast,
    TopologyEvent,
}

/// One frame on the `p2p` fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterMessage {
    pub kind: RouterMessageKind,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_groups: Option<Vec<String>>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Required on `p2p-request`, mirrored on `p2p-response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl RouterMessage {
    fn base(kind: RouterMessageKind, sender_id: impl Into<String>) -> Self {
        RouterMessage {
            kind,
            sender_id: sender_id.into(),
            target_id: None,
            target_groups: None,
            payload: serde_json::Map::new(),
            request_id: None,
            success: None,
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn heartbeat(sender_id: impl Into<String>) -> Self {
        RouterMessage::base(RouterMessageKind::Heartbeat, sender_id)
    }

    pub fn unicast(
        sender_id: impl Into<String>,
        target_id: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut msg = RouterMessage::base(RouterMessageKind::Unicast, sender_id);
        msg.target_id = Some(target_id.into());
        msg.payload = payload;
        msg
    }

    pub fn multicast(
        sender_id: impl Into<String>,
        groups: Vec<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut msg = RouterMessage::base(RouterMessageKind::Multicast, sender_id);
        msg.target_groups = Some(groups);
        msg.payload = payload;
        msg
    }

    pub fn broadcast(
        sender_id: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut msg = RouterMessage::base(RouterMessageKind::Broadcast, sender_id);
        msg.payload = payload;
        msg
    }

    pub fn request(
        sender_id: impl Into<String>,
        target_id: impl Into<String>,
        request_id: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut msg = RouterMessage::base(RouterMessageKind::P2pRequest, sender_id);
        msg.target_id = Some(target_id.into());
        msg.request_id = Some(request_id.into());
        msg.payload = payload;
        msg
    }

    /// A response mirroring `request`'s correlation id, addressed back to
    /// its sender.
    pub fn response_to(
        request: &RouterMessage,
        sender_id: impl Into<String>,
        success: bool,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut msg = RouterMessage::base(RouterMessageKind::P2pResponse, sender_id);
        msg.target_id = Some(request.sender_id.clone());
        msg.request_id = request.request_id.clone();
        msg.success = Some(success);
        msg.payload = payload;
        msg
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = Some(false);
        self.error = Some(error.into());
        self
    }
}

/// A registered client as other clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyEventKind {
    /// First event on every subscription: the full current client set.
    Snapshot,
    ClientJoined,
    ClientLeft,
    ClientMetadataChanged,
    ClientGroupsChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEvent {
    pub kind: TopologyEventKind,
    /// The client the delta concerns; absent on snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Full membership; only on snapshots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<ClientInfo>,
    pub timestamp: i64,
}

impl TopologyEvent {
    pub fn snapshot(clients: Vec<ClientInfo>) -> Self {
        TopologyEvent {
            kind: TopologyEventKind::Snapshot,
            client: None,
            clients,
            timestamp: now_ms(),
        }
    }

    pub fn delta(kind: TopologyEventKind, client: ClientInfo) -> Self {
        TopologyEvent {
            kind,
            client: Some(client),
            clients: Vec::new(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Previously assigned id, for reconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub server_time_ms: i64,
}

/// Filter for `getOnlineClients`: any listed group must match, and every
/// provided metadata key must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFilter {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ClientFilter {
    pub fn matches(&self, client: &ClientInfo) -> bool {
        if !self.groups.is_empty()
            && !self.groups.iter().any(|g| client.groups.contains(g))
        {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| client.metadata.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineClients {
    pub clients: Vec<ClientInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_json_roundtrip() {
        let mut payload = serde_json::Map::new();
        payload.insert("q".into(), serde_json::json!(1));
        let msg = RouterMessage::request("A", "B", "r1", payload);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"p2p-request\""));
        assert!(json.contains("\"senderId\":\"A\""));
        let back: RouterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn response_mirrors_request_id_and_sender() {
        let request = RouterMessage::request("A", "B", "r1", serde_json::Map::new());
        let response = RouterMessage::response_to(&request, "B", true, serde_json::Map::new());
        assert_eq!(response.kind, RouterMessageKind::P2pResponse);
        assert_eq!(response.request_id.as_deref(), Some("r1"));
        assert_eq!(response.target_id.as_deref(), Some("A"));
        assert_eq!(response.success, Some(true));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_string(&RouterMessage::heartbeat("A")).unwrap();
        assert!(!json.contains("targetId"));
        assert!(!json.contains("requestId"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn filter_matches_groups_and_metadata() {
        let client = ClientInfo {
            id: "x".into(),
            name: "worker".into(),
            groups: vec!["builders".into()],
            metadata: HashMap::from([("zone".to_string(), "eu".to_string())]),
        };

        assert!(ClientFilter::default().matches(&client));
        assert!(
            ClientFilter {
                groups: vec!["builders".into()],
                ..Default::default()
            }
            .matches(&client)
        );
        assert!(
            !ClientFilter {
                groups: vec!["testers".into()],
                ..Default::default()
            }
            .matches(&client)
        );
        assert!(
            !ClientFilter {
                metadata: HashMap::from([("zone".to_string(), "us".to_string())]),
                ..Default::default()
            }
            .matches(&client)
        );
    }
}
