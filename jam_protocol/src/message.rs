// Protocol messages exchanged through the relay.
//
// Every message on the wire is one flat JSON object: a `type` tag in
// kebab-case, the common `senderId` and `timestamp` fields, and the
// variant-specific fields in camelCase. Here that is split into an
// envelope (`JamMessage`) holding the common fields and a closed body enum
// (`MessageBody`) flattened into it, so dispatch sites match exhaustively on
// the body and unknown tags fail to decode.
//
// The `state-sync` snapshot is an opaque `serde_json::Value`. The protocol
// crate never inspects timer state; the sync crate converts it to and from the
// owning process's concrete state type.

use serde::{Deserialize, Serialize};

use crate::types::{ControlAction, Participant, ParticipantId};

/// A protocol message: common envelope fields plus a tagged body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JamMessage {
    /// Originating participant. Relay-originated messages may omit it.
    #[serde(default)]
    pub sender_id: ParticipantId,
    /// Unix epoch milliseconds at the sender.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl JamMessage {
    pub fn new(sender_id: ParticipantId, timestamp: u64, body: MessageBody) -> Self {
        Self {
            sender_id,
            timestamp,
            body,
        }
    }
}

/// Variant-specific part of a message, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MessageBody {
    /// Handshake sent right after the socket opens.
    Join { name: String, is_host: bool },
    /// Graceful departure.
    Leave,
    /// Full timer snapshot broadcast by the host.
    StateSync { state: serde_json::Value },
    /// Advisory notice of a host timer command.
    Control { action: ControlAction },
    /// Relay roster broadcast; authoritative for the host flag.
    ParticipantUpdate { participants: Vec<Participant> },
    /// Host asks the relay to hand the host role to another participant.
    TransferHost { new_host_id: ParticipantId },
    /// Relay-reported error.
    Error { message: String },
}

impl MessageBody {
    /// Wire tag of this variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::StateSync { .. } => "state-sync",
            Self::Control { .. } => "control",
            Self::ParticipantUpdate { .. } => "participant-update",
            Self::TransferHost { .. } => "transfer-host",
            Self::Error { .. } => "error",
        }
    }
}
