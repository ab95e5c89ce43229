// Session business logic: role, roster, state broadcast, and host transfer.
//
// `SessionCoordinator` is the only component that interprets protocol
// messages. It owns the `ReconnectingConnection` and the external timer, and
// mirrors whatever the relay says about the session:
//
// - **Role is the relay's call.** The local `is_host` flag is a cache of the
//   own entry in the last `participant-update`. There is no local election; a
//   roster with zero or several hosts is applied as-is.
// - **State flows one way.** A host reads a timer snapshot on every broadcast
//   tick and sends `state-sync`. A participant overwrites its timer with each
//   snapshot it receives, ignoring any that claim to come from itself.
// - **Control is advisory.** A `control` message only asks the owner to
//   re-render; the timer changes when the next `state-sync` arrives.
// - **One broadcast timer at most.** The broadcast deadline is reconciled after
//   every connection-state or role change: it runs iff this process is host
//   and connected. Becoming host also turns jam mode off; losing the role turns
//   it back on.
//
// Like the connection, the coordinator is time-agnostic: callers pass `now`
// and read `next_deadline()`. Owner notifications queue up as `SessionEvent`s.
//
// See also: `connection.rs` (transport lifecycle), `runtime.rs` (the event
// loop that drives this type on a background thread), `timer.rs`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use jam_protocol::message::{JamMessage, MessageBody};
use jam_protocol::types::{
    ConnectionState, ControlAction, Participant, ParticipantId, Session, SessionCode,
};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, JoinInfo, ReconnectingConnection};
use crate::timer::SessionTimer;
use crate::transport::{Transport, TransportEvent};
use crate::{generate_participant_id, now_millis};

/// Notifications for the owning process.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    ParticipantsChanged(Vec<Participant>),
    /// The relay flipped this process's host flag.
    HostChanged(bool),
    /// Timer state (or a hint about it) arrived; re-render.
    StateChanged,
}

/// Identity of the local participant in a session.
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub code: SessionCode,
    pub participant_id: ParticipantId,
    pub name: String,
    pub is_host: bool,
}

impl SessionParams {
    /// Start a new session under `code` as its host.
    pub fn host(code: SessionCode, name: impl Into<String>) -> Self {
        Self {
            code,
            participant_id: generate_participant_id(),
            name: name.into(),
            is_host: true,
        }
    }

    /// Join an existing session as a participant.
    pub fn join(code: SessionCode, name: impl Into<String>) -> Self {
        Self {
            code,
            participant_id: generate_participant_id(),
            name: name.into(),
            is_host: false,
        }
    }

    pub fn with_participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = id;
        self
    }
}

pub struct SessionCoordinator<T: Transport, S: SessionTimer> {
    connection: ReconnectingConnection<T>,
    timer: S,
    code: SessionCode,
    participant_id: ParticipantId,
    is_host: bool,
    participants: Vec<Participant>,
    created_at: u64,
    broadcast_interval: Duration,
    next_broadcast: Option<Instant>,
    events: VecDeque<SessionEvent>,
}

impl<T: Transport, S: SessionTimer> SessionCoordinator<T, S> {
    /// Build a coordinator. Participants put the timer into jam mode right
    /// away, since their state comes from the host.
    pub fn new(params: SessionParams, config: SyncConfig, transport: T, mut timer: S) -> Self {
        if !params.is_host {
            timer.set_jam_mode(true);
        }
        let broadcast_interval = config.state_sync_interval();
        let join = JoinInfo {
            code: params.code.clone(),
            participant_id: params.participant_id.clone(),
            name: params.name,
            is_host: params.is_host,
        };
        Self {
            connection: ReconnectingConnection::new(transport, config, join),
            timer,
            code: params.code,
            participant_id: params.participant_id,
            is_host: params.is_host,
            participants: Vec::new(),
            created_at: now_millis(),
            broadcast_interval,
            next_broadcast: None,
            events: VecDeque::new(),
        }
    }

    pub fn connect(&mut self, now: Instant) {
        info!(session = %self.code, participant = %self.participant_id, host = self.is_host, "joining session");
        self.connection.connect();
        self.pump(now);
    }

    /// Stop broadcasting and leave the session. Idempotent.
    pub fn disconnect(&mut self, now: Instant) {
        self.stop_broadcast();
        self.connection.disconnect();
        self.pump(now);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        self.connection.handle_transport_event(event, now);
        self.pump(now);
    }

    /// Fire whichever timers are due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        self.connection.poll_timers(now);
        self.pump(now);

        let Some(due) = self.next_broadcast else {
            return;
        };
        if now < due {
            return;
        }
        self.broadcast_state();
        // Skip ticks missed while the loop was busy instead of bursting them.
        let next = due + self.broadcast_interval;
        self.next_broadcast = Some(if next > now {
            next
        } else {
            now + self.broadcast_interval
        });
    }

    /// Earliest pending deadline (retry or broadcast).
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.connection.next_deadline(), self.next_broadcast) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Host only: tell participants about a timer command.
    pub fn send_control(&mut self, action: ControlAction) {
        if !self.is_host || !self.connection.is_connected() {
            debug!(?action, host = self.is_host, "control ignored");
            return;
        }
        let message = self.message(MessageBody::Control { action });
        self.connection.send(&message);
    }

    /// Host only: ask the relay to make `target` the host.
    pub fn transfer_host(&mut self, target: &ParticipantId) {
        if !self.is_host || !self.connection.is_connected() {
            debug!(%target, host = self.is_host, "transfer ignored");
            return;
        }
        if *target == self.participant_id {
            debug!("transfer to self ignored");
            return;
        }
        info!(session = %self.code, %target, "requesting host transfer");
        let message = self.message(MessageBody::TransferHost {
            new_host_id: target.clone(),
        });
        self.connection.send(&message);
    }

    /// Take every notification queued since the last drain.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Roster without this participant, for picking a transfer target.
    pub fn other_participants(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.id != self.participant_id)
            .cloned()
            .collect()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn session_code(&self) -> &SessionCode {
        &self.code
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_broadcasting(&self) -> bool {
        self.next_broadcast.is_some()
    }

    pub fn timer(&self) -> &S {
        &self.timer
    }

    /// Snapshot of the session as last reported by the relay.
    pub fn session(&self) -> Session {
        Session {
            code: self.code.clone(),
            host_id: self
                .participants
                .iter()
                .find(|p| p.is_host)
                .map(|p| p.id.clone()),
            participants: self.participants.clone(),
            created_at: self.created_at,
        }
    }

    /// Process everything the connection queued, in order.
    fn pump(&mut self, now: Instant) {
        for event in self.connection.drain_events() {
            match event {
                ConnectionEvent::StateChanged(state) => {
                    self.events.push_back(SessionEvent::ConnectionChanged(state));
                    self.reconcile_broadcast(now);
                }
                ConnectionEvent::Message(message) => self.handle_message(message, now),
            }
        }
    }

    fn handle_message(&mut self, message: JamMessage, now: Instant) {
        match message.body {
            MessageBody::StateSync { state } => {
                if self.is_host || message.sender_id == self.participant_id {
                    return;
                }
                match serde_json::from_value::<S::State>(state) {
                    Ok(state) => {
                        self.timer.set_state(state);
                        self.events.push_back(SessionEvent::StateChanged);
                    }
                    Err(e) => debug!(sender = %message.sender_id, error = %e, "dropping unreadable snapshot"),
                }
            }
            MessageBody::Control { action } => {
                if !self.is_host {
                    debug!(?action, sender = %message.sender_id, "host control notice");
                    self.events.push_back(SessionEvent::StateChanged);
                }
            }
            MessageBody::ParticipantUpdate { participants } => {
                self.apply_roster(participants, now);
            }
            MessageBody::Error { message: reason } => {
                warn!(session = %self.code, %reason, "relay reported an error");
            }
            MessageBody::Join { .. } | MessageBody::Leave | MessageBody::TransferHost { .. } => {
                // Relay bookkeeping; the roster update that follows carries
                // anything that matters here.
            }
        }
    }

    fn apply_roster(&mut self, participants: Vec<Participant>, now: Instant) {
        self.participants = participants;

        let own_flag = self
            .participants
            .iter()
            .rev()
            .find(|p| p.id == self.participant_id)
            .map(|p| p.is_host);
        if let Some(is_host) = own_flag.filter(|flag| *flag != self.is_host) {
            self.is_host = is_host;
            if is_host {
                info!(session = %self.code, "became host");
                self.timer.set_jam_mode(false);
            } else {
                info!(session = %self.code, "no longer host");
                self.timer.set_jam_mode(true);
            }
            self.reconcile_broadcast(now);
            self.events.push_back(SessionEvent::HostChanged(is_host));
        }

        self.events
            .push_back(SessionEvent::ParticipantsChanged(self.participants.clone()));
    }

    /// Run the broadcast timer iff host and connected.
    fn reconcile_broadcast(&mut self, now: Instant) {
        let should_run = self.is_host && self.connection.is_connected();
        match (should_run, self.next_broadcast.is_some()) {
            (true, false) => {
                debug!(interval_ms = self.broadcast_interval.as_millis() as u64, "starting state broadcast");
                self.next_broadcast = Some(now + self.broadcast_interval);
            }
            (false, true) => self.stop_broadcast(),
            _ => {}
        }
    }

    fn stop_broadcast(&mut self) {
        if self.next_broadcast.take().is_some() {
            debug!("stopping state broadcast");
        }
    }

    fn broadcast_state(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        let state = match serde_json::to_value(self.timer.get_state()) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "cannot serialize timer state");
                return;
            }
        };
        let message = self.message(MessageBody::StateSync { state });
        self.connection.send(&message);
    }

    fn message(&self, body: MessageBody) -> JamMessage {
        JamMessage::new(self.participant_id.clone(), now_millis(), body)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::transport::recording::{RecordingTransport, closed, frame, opened};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FakeState {
        remaining_seconds: u32,
        is_running: bool,
    }

    #[derive(Debug, Default)]
    struct FakeTimer {
        state: FakeState,
        jam_mode: bool,
        jam_mode_calls: Vec<bool>,
        set_calls: usize,
    }

    impl SessionTimer for FakeTimer {
        type State = FakeState;

        fn get_state(&self) -> FakeState {
            self.state.clone()
        }

        fn set_state(&mut self, state: FakeState) {
            self.state = state;
            self.set_calls += 1;
        }

        fn set_jam_mode(&mut self, enabled: bool) {
            self.jam_mode = enabled;
            self.jam_mode_calls.push(enabled);
        }
    }

    const INTERVAL: Duration = Duration::from_millis(1000);

    fn coordinator(
        id: &str,
        is_host: bool,
    ) -> (SessionCoordinator<RecordingTransport, FakeTimer>, RecordingTransport) {
        let transport = RecordingTransport::default();
        let params = SessionParams {
            code: SessionCode::from("AB12CD"),
            participant_id: ParticipantId::from(id),
            name: id.to_uppercase(),
            is_host,
        };
        let config = SyncConfig {
            server: Some("ws://relay.test".into()),
            max_reconnect_attempts: 3,
            ..SyncConfig::default()
        };
        let timer = FakeTimer {
            state: FakeState {
                remaining_seconds: 1500,
                is_running: true,
            },
            ..FakeTimer::default()
        };
        let coordinator = SessionCoordinator::new(params, config, transport.clone(), timer);
        (coordinator, transport)
    }

    /// Connect and complete the socket open.
    fn connected(
        id: &str,
        is_host: bool,
        now: Instant,
    ) -> (SessionCoordinator<RecordingTransport, FakeTimer>, RecordingTransport) {
        let (mut c, transport) = coordinator(id, is_host);
        c.connect(now);
        c.handle_transport_event(opened(c.connection.epoch()), now);
        (c, transport)
    }

    fn roster_frame(c: &SessionCoordinator<RecordingTransport, FakeTimer>, entries: &[(&str, bool)]) -> TransportEvent {
        let participants: Vec<serde_json::Value> = entries
            .iter()
            .map(|(id, host)| serde_json::json!({"id": id, "name": id, "isHost": host}))
            .collect();
        let text = serde_json::json!({
            "type": "participant-update",
            "senderId": "relay",
            "timestamp": 1,
            "participants": participants,
        })
        .to_string();
        frame(c.connection.epoch(), &text)
    }

    fn state_sync_frame(
        c: &SessionCoordinator<RecordingTransport, FakeTimer>,
        sender: &str,
        remaining: u32,
    ) -> TransportEvent {
        let text = serde_json::json!({
            "type": "state-sync",
            "senderId": sender,
            "timestamp": 2,
            "state": {"remainingSeconds": remaining, "isRunning": false},
        })
        .to_string();
        frame(c.connection.epoch(), &text)
    }

    fn sent_bodies(transport: &RecordingTransport) -> Vec<MessageBody> {
        transport
            .log
            .borrow()
            .sent_messages()
            .into_iter()
            .map(|m| m.body)
            .collect()
    }

    fn count_state_syncs(transport: &RecordingTransport) -> usize {
        sent_bodies(transport)
            .iter()
            .filter(|b| matches!(b, MessageBody::StateSync { .. }))
            .count()
    }

    #[test]
    fn participant_enters_jam_mode_on_construction() {
        let (c, _) = coordinator("p1", false);
        assert!(c.timer().jam_mode);
        let (h, _) = coordinator("h1", true);
        assert!(h.timer().jam_mode_calls.is_empty());
    }

    #[test]
    fn host_broadcasts_within_one_interval() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        let roster = roster_frame(&c, &[("h1", true), ("p1", false)]);
        c.handle_transport_event(roster, t0);

        assert!(c.is_broadcasting());
        assert_eq!(c.next_deadline(), Some(t0 + INTERVAL));

        c.poll_timers(t0 + INTERVAL);
        let sent = transport.log.borrow().sent_messages();
        let syncs: Vec<&JamMessage> = sent
            .iter()
            .filter(|m| matches!(m.body, MessageBody::StateSync { .. }))
            .collect();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].sender_id, ParticipantId::from("h1"));
        match &syncs[0].body {
            MessageBody::StateSync { state } => {
                assert_eq!(state["remainingSeconds"], 1500);
                assert_eq!(state["isRunning"], true);
            }
            other => panic!("expected state-sync, got {other:?}"),
        }
        assert_eq!(c.next_deadline(), Some(t0 + INTERVAL * 2));
    }

    #[test]
    fn broadcast_reads_state_at_tick_time() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        c.poll_timers(t0 + INTERVAL);
        c.timer.state.remaining_seconds = 1200;
        c.poll_timers(t0 + INTERVAL * 2);

        let remaining: Vec<serde_json::Value> = sent_bodies(&transport)
            .into_iter()
            .filter_map(|b| match b {
                MessageBody::StateSync { state } => Some(state["remainingSeconds"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![serde_json::json!(1500), serde_json::json!(1200)]);
    }

    #[test]
    fn only_one_broadcast_timer() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        // Repeated rosters confirming host must not stack timers.
        for _ in 0..3 {
            let roster = roster_frame(&c, &[("h1", true)]);
            c.handle_transport_event(roster, t0);
        }
        c.poll_timers(t0 + INTERVAL);
        assert_eq!(count_state_syncs(&transport), 1);
    }

    #[test]
    fn late_poll_skips_missed_ticks() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        c.poll_timers(t0 + INTERVAL * 5 + Duration::from_millis(10));
        assert_eq!(count_state_syncs(&transport), 1);
        assert_eq!(
            c.next_deadline(),
            Some(t0 + INTERVAL * 6 + Duration::from_millis(10))
        );
    }

    #[test]
    fn participant_never_broadcasts() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("p1", false, t0);
        assert!(!c.is_broadcasting());
        c.poll_timers(t0 + INTERVAL * 3);
        assert_eq!(count_state_syncs(&transport), 0);
    }

    #[test]
    fn participant_applies_state_sync() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();

        let sync = state_sync_frame(&c, "h1", 42);
        c.handle_transport_event(sync, t0);
        assert_eq!(
            c.timer().state,
            FakeState {
                remaining_seconds: 42,
                is_running: false
            }
        );
        assert_eq!(c.drain_events(), vec![SessionEvent::StateChanged]);
    }

    #[test]
    fn own_state_sync_echo_is_ignored() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();

        let echo = state_sync_frame(&c, "p1", 42);
        c.handle_transport_event(echo, t0);
        assert_eq!(c.timer().set_calls, 0);
        assert_eq!(c.timer().state.remaining_seconds, 1500);
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn host_ignores_state_sync() {
        let t0 = Instant::now();
        let (mut c, _) = connected("h1", true, t0);
        c.drain_events();

        let sync = state_sync_frame(&c, "other", 1);
        c.handle_transport_event(sync, t0);
        assert_eq!(c.timer().set_calls, 0);
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn unreadable_snapshot_is_dropped() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();

        let text = r#"{"type":"state-sync","senderId":"h1","timestamp":1,"state":"garbage"}"#;
        c.handle_transport_event(frame(c.connection.epoch(), text), t0);
        assert_eq!(c.timer().set_calls, 0);
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn control_only_notifies() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();
        let before = c.timer().state.clone();

        let text = r#"{"type":"control","senderId":"h1","timestamp":1,"action":"pause"}"#;
        c.handle_transport_event(frame(c.connection.epoch(), text), t0);
        assert_eq!(c.timer().state, before);
        assert_eq!(c.timer().set_calls, 0);
        assert_eq!(c.drain_events(), vec![SessionEvent::StateChanged]);

        // The actual change arrives with the next snapshot.
        let sync = state_sync_frame(&c, "h1", 900);
        c.handle_transport_event(sync, t0);
        assert_eq!(c.timer().state.remaining_seconds, 900);
        assert!(!c.timer().state.is_running);
    }

    #[test]
    fn promotion_to_host() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("p1", false, t0);
        c.drain_events();

        let roster = roster_frame(&c, &[("h1", false), ("p1", true)]);
        c.handle_transport_event(roster, t0);

        assert!(c.is_host());
        assert!(!c.timer().jam_mode);
        assert_eq!(c.timer().jam_mode_calls, vec![true, false]);
        assert!(c.is_broadcasting());
        let events = c.drain_events();
        assert_eq!(events[0], SessionEvent::HostChanged(true));
        assert!(matches!(&events[1], SessionEvent::ParticipantsChanged(p) if p.len() == 2));

        c.poll_timers(t0 + INTERVAL);
        assert_eq!(count_state_syncs(&transport), 1);
    }

    #[test]
    fn demotion_stops_broadcast_and_restores_jam_mode() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        c.drain_events();

        let roster = roster_frame(&c, &[("h1", false), ("p1", true)]);
        c.handle_transport_event(roster, t0);
        assert!(!c.is_host());
        assert!(c.timer().jam_mode);
        assert!(!c.is_broadcasting());
        assert_eq!(c.drain_events()[0], SessionEvent::HostChanged(false));

        c.poll_timers(t0 + INTERVAL * 2);
        assert_eq!(count_state_syncs(&transport), 0);

        // Now a participant, so the new host's snapshots apply.
        let sync = state_sync_frame(&c, "p1", 10);
        c.handle_transport_event(sync, t0);
        assert_eq!(c.timer().state.remaining_seconds, 10);
    }

    #[test]
    fn unchanged_role_only_updates_roster() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();

        let roster = roster_frame(&c, &[("h1", true), ("p1", false), ("p2", false)]);
        c.handle_transport_event(roster, t0);
        let events = c.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::ParticipantsChanged(p) if p.len() == 3));
        assert_eq!(c.participants().len(), 3);
        let others: Vec<String> = c
            .other_participants()
            .into_iter()
            .map(|p| p.id.0)
            .collect();
        assert_eq!(others, vec!["h1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn roster_without_own_entry_keeps_role() {
        let t0 = Instant::now();
        let (mut c, _) = connected("h1", true, t0);
        let roster = roster_frame(&c, &[("p1", true)]);
        c.handle_transport_event(roster, t0);
        assert!(c.is_host());
        assert!(c.is_broadcasting());
        assert_eq!(c.session().host_id, Some(ParticipantId::from("p1")));
    }

    #[test]
    fn roster_with_two_hosts_is_mirrored() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        let roster = roster_frame(&c, &[("h1", true), ("p1", true)]);
        c.handle_transport_event(roster, t0);
        assert!(c.is_host());
        let session = c.session();
        assert_eq!(session.host_id, Some(ParticipantId::from("h1")));
        assert_eq!(session.code, SessionCode::from("AB12CD"));
        assert_eq!(session.participants.len(), 2);
    }

    #[test]
    fn send_control_requires_host_and_connection() {
        let t0 = Instant::now();
        let (mut host, host_transport) = coordinator("h1", true);
        host.send_control(ControlAction::Start);
        assert!(host_transport.log.borrow().sent.is_empty());

        host.connect(t0);
        host.handle_transport_event(opened(host.connection.epoch()), t0);
        host.send_control(ControlAction::Pause);
        assert_eq!(
            sent_bodies(&host_transport).last(),
            Some(&MessageBody::Control {
                action: ControlAction::Pause
            })
        );

        let (mut participant, participant_transport) = connected("p1", false, t0);
        participant.send_control(ControlAction::Skip);
        assert!(
            !sent_bodies(&participant_transport)
                .iter()
                .any(|b| matches!(b, MessageBody::Control { .. }))
        );
    }

    #[test]
    fn transfer_host_rules() {
        let t0 = Instant::now();
        let (mut host, transport) = connected("h1", true, t0);
        let transfers = |t: &RecordingTransport| {
            sent_bodies(t)
                .into_iter()
                .filter(|b| matches!(b, MessageBody::TransferHost { .. }))
                .collect::<Vec<_>>()
        };

        host.transfer_host(&ParticipantId::from("h1"));
        assert!(transfers(&transport).is_empty());

        host.transfer_host(&ParticipantId::from("p1"));
        assert_eq!(
            transfers(&transport),
            vec![MessageBody::TransferHost {
                new_host_id: ParticipantId::from("p1")
            }]
        );

        let (mut participant, participant_transport) = connected("p1", false, t0);
        participant.transfer_host(&ParticipantId::from("h1"));
        assert!(transfers(&participant_transport).is_empty());

        // Sending is no-op once disconnected, even for the host.
        host.disconnect(t0);
        host.transfer_host(&ParticipantId::from("p2"));
        assert_eq!(transfers(&transport).len(), 1);
    }

    #[test]
    fn transfer_itself_changes_nothing_locally() {
        let t0 = Instant::now();
        let (mut host, _) = connected("h1", true, t0);
        host.drain_events();
        host.transfer_host(&ParticipantId::from("p1"));
        assert!(host.is_host());
        assert!(host.is_broadcasting());
        assert!(host.drain_events().is_empty());
    }

    #[test]
    fn malformed_input_then_valid_message() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        c.drain_events();

        c.handle_transport_event(frame(c.connection.epoch(), "}{ not json"), t0);
        c.handle_transport_event(frame(c.connection.epoch(), "\u{0}\u{1}"), t0);
        assert!(c.drain_events().is_empty());
        assert_eq!(c.timer().set_calls, 0);
        assert_eq!(c.connection_state(), ConnectionState::Connected);

        let sync = state_sync_frame(&c, "h1", 7);
        c.handle_transport_event(sync, t0);
        assert_eq!(c.timer().state.remaining_seconds, 7);
        assert_eq!(c.drain_events(), vec![SessionEvent::StateChanged]);
    }

    #[test]
    fn disconnect_stops_broadcast_and_is_idempotent() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        c.drain_events();
        assert!(c.is_broadcasting());

        c.disconnect(t0);
        c.disconnect(t0);
        assert!(!c.is_broadcasting());
        assert_eq!(c.next_deadline(), None);
        assert_eq!(c.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            c.drain_events(),
            vec![SessionEvent::ConnectionChanged(ConnectionState::Disconnected)]
        );

        c.poll_timers(t0 + INTERVAL * 10);
        assert_eq!(count_state_syncs(&transport), 0);
    }

    #[test]
    fn drop_pauses_broadcast_until_reconnected() {
        let t0 = Instant::now();
        let (mut c, transport) = connected("h1", true, t0);
        c.handle_transport_event(closed(c.connection.epoch()), t0);
        assert!(!c.is_broadcasting());
        assert_eq!(c.connection_state(), ConnectionState::Connecting);
        // Only the retry deadline is pending.
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(1000)));

        let t1 = t0 + Duration::from_millis(1000);
        c.poll_timers(t1);
        c.handle_transport_event(opened(c.connection.epoch()), t1);
        assert!(c.is_broadcasting());
        c.poll_timers(t1 + INTERVAL);
        assert_eq!(count_state_syncs(&transport), 1);
    }

    #[test]
    fn connection_changes_are_reported_in_order() {
        let t0 = Instant::now();
        let (mut c, _) = connected("p1", false, t0);
        assert_eq!(
            c.drain_events(),
            vec![
                SessionEvent::ConnectionChanged(ConnectionState::Connecting),
                SessionEvent::ConnectionChanged(ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = SessionParams::host(SessionCode::from("X"), "a");
        let b = SessionParams::join(SessionCode::from("X"), "b");
        assert_ne!(a.participant_id, b.participant_id);
        assert!(a.is_host);
        assert!(!b.is_host);
    }
}
