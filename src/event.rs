//! Typed events published to the orchestrator's unified event stream, and
//! the dispatch logic that turns a raw `[<command>, <payload>]` envelope
//! into one.

use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::session::SessionId;

/// Command names recognized in the post-handshake wire protocol, per
/// `spec.md` §3 and §6.
pub mod command_name {
    pub const FACTS: &str = "Facts";
    pub const NOTIFICATION: &str = "Notification";
    pub const LAST_KNOWN_STATE: &str = "LastKnownState";
    pub const SUBSCRIBED: &str = "Subscribed";
    pub const RIDE_CONNECTION: &str = "RideConnection";
    pub const USER_MESSAGE: &str = "UserMessage";
    pub const UNKNOWN_COMMAND: &str = "UnknownCommand";
    pub const MALFORMED_COMMAND: &str = "MalformedCommand";
    pub const INVALID_SYNTAX: &str = "InvalidSyntax";
    pub const DISALLOWED_UID: &str = "DisallowedUID";

    pub const GET_FACTS: &str = "GetFacts";
    pub const GET_LAST_KNOWN_STATE: &str = "GetLastKnownState";
    pub const SUBSCRIBE: &str = "Subscribe";
    pub const POLL_FACTS: &str = "PollFacts";
    pub const STOP_FACTS_POLLING: &str = "StopFactsPolling";
    pub const BUMP_FACTS: &str = "BumpFacts";
    pub const CONNECT_RIDE: &str = "ConnectRide";
    pub const DISCONNECT_RIDE: &str = "DisconnectRide";
}

/// Response to a `GetFacts` / `PollFacts` request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FactsResponse {
    #[serde(rename = "UID", default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(rename = "Facts", default)]
    pub facts: Vec<Fact>,
}

/// A response payload the core does not interpret beyond extracting its
/// optional UID. Per `spec.md` §1's non-goal "no interpretation of fact
/// semantics", every command besides `Facts` is forwarded opaquely.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaquePayload {
    pub uid: Option<String>,
    pub value: serde_json::Value,
}

impl OpaquePayload {
    fn from_value(value: serde_json::Value) -> Self {
        let uid = value
            .get("UID")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        Self { uid, value }
    }
}

/// A fully decoded, session-less command payload. `Connection` attaches the
/// `SessionId` when turning one of these into an `Event`.
#[derive(Debug, Clone)]
pub enum CommandPayload {
    Facts(FactsResponse),
    Notification(OpaquePayload),
    LastKnownState(OpaquePayload),
    Subscribed(OpaquePayload),
    RideConnection(OpaquePayload),
    UserMessage(OpaquePayload),
    UnknownCommand(OpaquePayload),
    MalformedCommand(OpaquePayload),
    InvalidSyntax(OpaquePayload),
    DisallowedUID(OpaquePayload),
}

impl CommandPayload {
    pub fn uid(&self) -> Option<&str> {
        match self {
            CommandPayload::Facts(f) => f.uid.as_deref(),
            CommandPayload::Notification(p)
            | CommandPayload::LastKnownState(p)
            | CommandPayload::Subscribed(p)
            | CommandPayload::RideConnection(p)
            | CommandPayload::UserMessage(p)
            | CommandPayload::UnknownCommand(p)
            | CommandPayload::MalformedCommand(p)
            | CommandPayload::InvalidSyntax(p)
            | CommandPayload::DisallowedUID(p) => p.uid.as_deref(),
        }
    }

    pub fn into_event(self, session: SessionId) -> Event {
        match self {
            CommandPayload::Facts(response) => Event::Facts { session, response },
            CommandPayload::Notification(p) => Event::Notification {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::LastKnownState(p) => Event::LastKnownState {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::Subscribed(p) => Event::Subscribed {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::RideConnection(p) => Event::RideConnection {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::UserMessage(p) => Event::UserMessage {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::UnknownCommand(p) => Event::UnknownCommand {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::MalformedCommand(p) => Event::MalformedCommand {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::InvalidSyntax(p) => Event::InvalidSyntax {
                session,
                uid: p.uid,
                payload: p.value,
            },
            CommandPayload::DisallowedUID(p) => Event::DisallowedUID {
                session,
                uid: p.uid,
                payload: p.value,
            },
        }
    }
}

/// Parse a `[<command-name>, <payload>]` envelope's second element into a
/// typed `CommandPayload`. Returns `None` for an unrecognized command name,
/// which the read loop drops without killing the session (`spec.md` §4.2).
pub fn decode_command(
    name: &str,
    payload: serde_json::Value,
) -> Result<Option<CommandPayload>, serde_json::Error> {
    use command_name::*;
    Ok(Some(match name {
        FACTS => CommandPayload::Facts(serde_json::from_value(payload)?),
        NOTIFICATION => CommandPayload::Notification(OpaquePayload::from_value(payload)),
        LAST_KNOWN_STATE => CommandPayload::LastKnownState(OpaquePayload::from_value(payload)),
        SUBSCRIBED => CommandPayload::Subscribed(OpaquePayload::from_value(payload)),
        RIDE_CONNECTION => CommandPayload::RideConnection(OpaquePayload::from_value(payload)),
        USER_MESSAGE => CommandPayload::UserMessage(OpaquePayload::from_value(payload)),
        UNKNOWN_COMMAND => CommandPayload::UnknownCommand(OpaquePayload::from_value(payload)),
        MALFORMED_COMMAND => CommandPayload::MalformedCommand(OpaquePayload::from_value(payload)),
        INVALID_SYNTAX => CommandPayload::InvalidSyntax(OpaquePayload::from_value(payload)),
        DISALLOWED_UID => CommandPayload::DisallowedUID(OpaquePayload::from_value(payload)),
        _ => return Ok(None),
    }))
}

/// A tagged event published on the orchestrator's unified event stream.
#[derive(Debug, Clone)]
pub enum Event {
    SessionConnected {
        session: SessionId,
        host: String,
        port: u16,
        name: Option<String>,
    },
    SessionDisconnected {
        session: SessionId,
        host: String,
        port: u16,
        name: Option<String>,
        reason: String,
    },
    Facts {
        session: SessionId,
        response: FactsResponse,
    },
    Notification {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    LastKnownState {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    Subscribed {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    RideConnection {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    UserMessage {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    UnknownCommand {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    MalformedCommand {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    InvalidSyntax {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
    DisallowedUID {
        session: SessionId,
        uid: Option<String>,
        payload: serde_json::Value,
    },
}

impl Event {
    pub fn session(&self) -> SessionId {
        match self {
            Event::SessionConnected { session, .. }
            | Event::SessionDisconnected { session, .. }
            | Event::Facts { session, .. }
            | Event::Notification { session, .. }
            | Event::LastKnownState { session, .. }
            | Event::Subscribed { session, .. }
            | Event::RideConnection { session, .. }
            | Event::UserMessage { session, .. }
            | Event::UnknownCommand { session, .. }
            | Event::MalformedCommand { session, .. }
            | Event::InvalidSyntax { session, .. }
            | Event::DisallowedUID { session, .. } => *session,
        }
    }
}

/// Build the outgoing `[<command>, <payload>]` envelope bytes for one
/// command, injecting `UID` into `payload` when one is supplied.
pub fn encode_envelope(
    command: &str,
    mut payload: serde_json::Value,
    uid: Option<&str>,
) -> Result<Vec<u8>, serde_json::Error> {
    if let Some(uid) = uid {
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("UID".to_owned(), serde_json::Value::String(uid.to_owned()));
        }
    }
    serde_json::to_vec(&(command, payload))
}

/// Build a `GetFacts` payload: `{"Facts": [<int>, ...]}` (UID injected by
/// `encode_envelope`).
pub fn get_facts_payload(kinds: &[crate::fact::FactKind]) -> serde_json::Value {
    serde_json::json!({ "Facts": kinds })
}
