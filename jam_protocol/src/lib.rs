// jam_protocol — wire protocol for Pomodoro Jam shared-timer sessions.
//
// This crate defines the message vocabulary and shared data types exchanged
// between jam clients through the third-party relay. It has no networking or
// timer logic; `jam_sync` drives it.
//
// Module overview:
// - `types.rs`:    Identifiers (`ParticipantId`, `SessionCode`), roster entries
//                  (`Participant`), the mirrored `Session`, `ConnectionState`,
//                  and `ControlAction`.
// - `message.rs`:  The `JamMessage` envelope and the closed `MessageBody` enum,
//                  one variant per wire `type`.
// - `codec.rs`:    JSON text encoding for one WebSocket frame per message,
//                  with a size guard on decode.
//
// Design decisions:
// - **JSON text frames.** The relay is a hosted WebSocket service that other
//   (non-Rust) clients also talk to, so the field names and tags are fixed by
//   the existing wire format: kebab-case tags, camelCase fields.
// - **Timer state as opaque JSON.** The protocol never inspects snapshots, which
//   keeps this crate independent of any particular timer implementation.

pub mod codec;
pub mod message;
pub mod types;

pub use codec::{CodecError, MAX_MESSAGE_LEN, decode, encode};
pub use message::{JamMessage, MessageBody};
pub use types::{ConnectionState, ControlAction, Participant, ParticipantId, Session, SessionCode};
