// Core data types for the jam protocol.
//
// `ParticipantId` and `SessionCode` are string newtypes rather than integers:
// the relay is a third-party service and both values travel verbatim in the
// connection URL, so they stay opaque. `Participant` mirrors one roster entry
// as the relay broadcasts it, and `Session` is the locally mirrored view of a
// whole session (the relay owns the real one).
//
// `ConnectionState` lives here instead of in the sync crate because session
// events carry it to the owning process, which only depends on this crate's
// vocabulary for rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque participant identifier, unique within a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Short code naming the relay channel a session rendezvouses on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(pub String);

impl SessionCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionCode {
    fn from(code: &str) -> Self {
        Self(code.to_owned())
    }
}

/// One entry of the relay's participant roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub is_host: bool,
}

/// Local mirror of a session. The relay is the source of truth; this is
/// rebuilt from the last roster it sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub code: SessionCode,
    /// First roster entry flagged as host, if the roster has one.
    pub host_id: Option<ParticipantId>,
    pub participants: Vec<Participant>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// Connection lifecycle as seen by the owning process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection gave up (or the transport could not be built). Only an
    /// explicit `connect()` leaves this state.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Timer commands a host can relay to participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Pause,
    Reset,
    Skip,
}
