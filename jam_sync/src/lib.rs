// jam_sync — relay connection and host-driven state sync for jam sessions.
//
// A jam session is one host and any number of participants sharing a timer
// through a third-party WebSocket relay. The relay tracks membership and
// decides who is host; this crate keeps a client connected to it, mirrors its
// roster, broadcasts timer snapshots while hosting, and applies them while
// participating.
//
// Module overview:
// - `config.rs`:       `SyncConfig` (relay address, broadcast cadence, backoff
//                      policy) and relay URL construction.
// - `transport.rs`:    The `Transport` seam and `WsTransport`, a blocking
//                      tungstenite socket pumped by one I/O thread per socket.
// - `connection.rs`:   `ReconnectingConnection`, the connection state machine
//                      with bounded exponential-backoff retries.
// - `coordinator.rs`:  `SessionCoordinator`, the session logic: role mirror,
//                      state broadcast/apply, control and host transfer.
// - `timer.rs`:        `SessionTimer`, the contract for the shared timer.
// - `runtime.rs`:      `SessionHandle` and the session thread that drives a
//                      coordinator from one `mpsc` channel.
// - `error.rs`:        `SyncError`.
//
// The connection and coordinator are sans-I/O state machines that take the
// current `Instant` as an argument and report their next deadline. Only
// `transport.rs` and `runtime.rs` touch threads and the network.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod runtime;
pub mod timer;
pub mod transport;

pub use config::{DEFAULT_SERVER, SyncConfig};
pub use connection::{ConnectionEvent, JoinInfo, ReconnectingConnection};
pub use coordinator::{SessionCoordinator, SessionEvent, SessionParams};
pub use error::SyncError;
pub use runtime::SessionHandle;
pub use timer::SessionTimer;
pub use transport::{Transport, TransportEvent, TransportEventKind, WsTransport};

use jam_protocol::types::ParticipantId;

/// Length of generated participant ids.
const PARTICIPANT_ID_LEN: usize = 12;

/// Current wall-clock time as Unix epoch milliseconds, for message stamps.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Fresh random participant id: short, lowercase, URL-safe.
pub(crate) fn generate_participant_id() -> ParticipantId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(PARTICIPANT_ID_LEN);
    ParticipantId(id)
}
