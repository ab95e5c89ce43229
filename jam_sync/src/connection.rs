// One logical relay connection with bounded exponential-backoff reconnection.
//
// `ReconnectingConnection` owns the `ConnectionState` and is the only thing
// that changes it. It is a plain state machine: it never sleeps or spawns.
// The runtime feeds it transport events and the current time, asks it for its
// next deadline, and calls `poll_timers` when that deadline passes. That keeps
// the retry schedule fully deterministic under test.
//
// State machine:
// - `connect()` (explicit): resets the attempt counter, cancels any pending
//   retry, moves to `Connecting`, and asks the transport to open. If the
//   transport cannot even build the request, the state goes straight to
//   `Error` with no retry.
// - `Opened`: moves to `Connected`, resets the counter, sends `join`.
// - `Closed` (not after `disconnect()`): while attempts < max, increments the
//   counter and schedules a single retry `base * 2^(n - 1)` later in state
//   `Connecting`; otherwise moves to `Error` and schedules nothing.
// - Retry deadline: re-opens unless the state has become `Disconnected`. A
//   retry whose open is refused counts as another failed attempt.
// - `disconnect()`: clears the retry deadline, moves to `Disconnected`, sends
//   `leave` if connected, closes the socket, and bumps the epoch so anything
//   still in flight from the old socket is ignored.
//
// State changes and decoded inbound messages queue up as `ConnectionEvent`s
// in arrival order; the coordinator drains them after every call.
//
// See also: `transport.rs` for the epoch-tagged event stream, `config.rs` for
// the backoff policy, `coordinator.rs` for the consumer.

use std::collections::VecDeque;
use std::time::Instant;

use jam_protocol::codec;
use jam_protocol::message::{JamMessage, MessageBody};
use jam_protocol::types::{ConnectionState, ParticipantId, SessionCode};
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::now_millis;
use crate::transport::{Transport, TransportEvent, TransportEventKind};

/// Output of the connection, drained by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message(JamMessage),
}

/// Who this connection joins as. Fixed for the connection's lifetime.
#[derive(Clone, Debug)]
pub struct JoinInfo {
    pub code: SessionCode,
    pub participant_id: ParticipantId,
    pub name: String,
    pub is_host: bool,
}

pub struct ReconnectingConnection<T: Transport> {
    transport: T,
    config: SyncConfig,
    join: JoinInfo,
    state: ConnectionState,
    /// Failed attempts since the last successful open.
    attempts: u32,
    /// Tag of the socket we are currently waiting on.
    epoch: u64,
    /// Whether the transport holds a socket (opening or open).
    socket_live: bool,
    retry_at: Option<Instant>,
    events: VecDeque<ConnectionEvent>,
}

impl<T: Transport> ReconnectingConnection<T> {
    pub fn new(transport: T, config: SyncConfig, join: JoinInfo) -> Self {
        Self {
            transport,
            config,
            join,
            state: ConnectionState::Disconnected,
            attempts: 0,
            epoch: 0,
            socket_live: false,
            retry_at: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Pending retry deadline, if one is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn join_info(&self) -> &JoinInfo {
        &self.join
    }

    /// Open (or re-open) the connection on explicit request. No-op while
    /// connected or while an open is already in flight. The handshake has no
    /// timeout of its own, so a relay that accepts TCP and then stays silent
    /// keeps the connection in `Connecting` until the OS gives up on the
    /// socket; call `disconnect()` first to abandon such an open.
    pub fn connect(&mut self) {
        let opening = self.state == ConnectionState::Connecting && self.retry_at.is_none();
        if self.state == ConnectionState::Connected || (opening && self.socket_live) {
            trace!(state = %self.state, "connect ignored");
            return;
        }

        self.retry_at = None;
        self.attempts = 0;
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.open_socket() {
            warn!(session = %self.join.code, error = %e, "cannot open relay connection");
            self.set_state(ConnectionState::Error);
        }
    }

    /// Best-effort send. Dropped silently unless connected.
    pub fn send(&mut self, message: &JamMessage) {
        if !self.is_connected() {
            trace!(kind = message.body.kind(), state = %self.state, "not connected, dropping");
            return;
        }
        self.transmit(message);
    }

    /// Stop for good: cancel retries, say goodbye if possible, close the
    /// socket. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.retry_at = None;
        let was_connected = self.is_connected();
        self.set_state(ConnectionState::Disconnected);

        if self.socket_live {
            if was_connected {
                let leave = JamMessage::new(
                    self.join.participant_id.clone(),
                    now_millis(),
                    MessageBody::Leave,
                );
                self.transmit(&leave);
            }
            self.transport.close();
            self.socket_live = false;
            info!(session = %self.join.code, "disconnected from relay");
        }
        self.epoch += 1;
    }

    /// Feed one transport event. Events from older sockets are ignored.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if event.epoch != self.epoch {
            trace!(event_epoch = event.epoch, epoch = self.epoch, "stale transport event");
            return;
        }

        match event.kind {
            TransportEventKind::Opened => {
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                let join = JamMessage::new(
                    self.join.participant_id.clone(),
                    now_millis(),
                    MessageBody::Join {
                        name: self.join.name.clone(),
                        is_host: self.join.is_host,
                    },
                );
                self.transmit(&join);
            }
            TransportEventKind::Message(text) => match codec::decode(&text) {
                Ok(message) => self.events.push_back(ConnectionEvent::Message(message)),
                Err(e) => debug!(error = %e, "dropping undecodable frame"),
            },
            TransportEventKind::Closed => {
                self.socket_live = false;
                self.handle_drop(now);
            }
        }
    }

    /// Fire the retry timer if it is due.
    pub fn poll_timers(&mut self, now: Instant) {
        let Some(retry_at) = self.retry_at else {
            return;
        };
        if now < retry_at {
            return;
        }
        self.retry_at = None;
        if self.state == ConnectionState::Disconnected {
            return;
        }

        debug!(session = %self.join.code, attempt = self.attempts, "retrying relay connection");
        if let Err(e) = self.open_socket() {
            warn!(attempt = self.attempts, error = %e, "retry could not open socket");
            self.handle_drop(now);
        }
    }

    /// Take everything queued since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Socket lost or never opened: schedule the next retry or give up.
    fn handle_drop(&mut self, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let attempt = self.attempts.saturating_add(1);
        let delay = self.config.reconnect_delay(attempt);
        // A delay past the end of `Instant` can never fire; treat it as exhausted.
        let retry_at = if self.attempts < self.config.max_reconnect_attempts {
            now.checked_add(delay)
        } else {
            None
        };

        match retry_at {
            Some(retry_at) => {
                self.attempts = attempt;
                warn!(
                    session = %self.join.code,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "relay connection lost, scheduling retry"
                );
                self.set_state(ConnectionState::Connecting);
                self.retry_at = Some(retry_at);
            }
            None => {
                warn!(
                    session = %self.join.code,
                    attempts = self.attempts,
                    "reconnect attempts exhausted"
                );
                self.retry_at = None;
                self.set_state(ConnectionState::Error);
            }
        }
    }

    fn open_socket(&mut self) -> crate::error::Result<()> {
        let url = self.config.relay_url(
            &self.join.code,
            &self.join.participant_id,
            &self.join.name,
            self.join.is_host,
        )?;
        self.epoch += 1;
        self.transport.open(&url, self.epoch)?;
        self.socket_live = true;
        debug!(session = %self.join.code, epoch = self.epoch, "opening relay socket");
        Ok(())
    }

    fn transmit(&mut self, message: &JamMessage) {
        let text = match codec::encode(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = message.body.kind(), error = %e, "cannot encode message");
                return;
            }
        };
        if let Err(e) = self.transport.send(text) {
            debug!(kind = message.body.kind(), error = %e, "send failed");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "connection state");
        self.state = state;
        self.events.push_back(ConnectionEvent::StateChanged(state));
    }
}
