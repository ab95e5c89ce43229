// Background event loop that drives a `SessionCoordinator` over WebSocket.
//
// Architecture: one session thread plus one I/O thread per socket.
//
// - **Socket threads** (spawned by `WsTransport`): own the WebSocket and post
//   epoch-tagged `TransportEvent`s into the session channel.
// - **Session thread**: owns the coordinator exclusively. It receives from a
//   single `mpsc` channel that carries both transport events and commands
//   from the owner's `SessionHandle`, so every mutation happens sequentially
//   on this thread. It waits with `recv_timeout` until the coordinator's
//   earliest deadline (reconnect retry or broadcast tick), which gives us both
//   timers without a timer thread. After each wakeup it fires due timers and
//   forwards queued `SessionEvent`s to the handle.
// - **Owner**: holds the `SessionHandle`, sends commands, and drains events
//   with the non-blocking `poll()`, which also refreshes the handle's mirror of
//   connection state, role, and roster.
//
// Shutdown: `SessionHandle::shutdown` (or dropping the handle) sends
// `Shutdown`, which disconnects the coordinator (leave + socket close) and
// ends the loop; the handle then joins the session thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use jam_protocol::types::{ConnectionState, ControlAction, Participant, ParticipantId, SessionCode};
use tracing::{debug, info_span};

use crate::config::SyncConfig;
use crate::coordinator::{SessionCoordinator, SessionEvent, SessionParams};
use crate::error::Result;
use crate::timer::SessionTimer;
use crate::transport::{TransportEvent, WsTransport};

/// Everything the session thread reacts to.
enum Input {
    Transport(TransportEvent),
    Command(Command),
}

impl From<TransportEvent> for Input {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    SendControl(ControlAction),
    TransferHost(ParticipantId),
    Disconnect,
    Shutdown,
}

type WsCoordinator<S> = SessionCoordinator<WsTransport<Input>, S>;

/// Owner-side handle to a running session.
pub struct SessionHandle {
    inputs: Sender<Input>,
    events: Receiver<SessionEvent>,
    thread: Option<JoinHandle<()>>,
    code: SessionCode,
    participant_id: ParticipantId,
    connection_state: ConnectionState,
    is_host: bool,
    participants: Vec<Participant>,
}

impl SessionHandle {
    /// Start the session thread. The session stays disconnected until
    /// `connect()` is called.
    pub fn spawn<S>(params: SessionParams, config: SyncConfig, timer: S) -> Result<Self>
    where
        S: SessionTimer + Send + 'static,
    {
        let (inputs_tx, inputs_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();

        let code = params.code.clone();
        let participant_id = params.participant_id.clone();
        let is_host = params.is_host;
        let transport = WsTransport::new(inputs_tx.clone());

        let thread = thread::Builder::new()
            .name(format!("jam-session-{code}"))
            .spawn(move || {
                let span = info_span!("jam_session", session = %params.code, participant = %params.participant_id);
                let _entered = span.enter();
                let coordinator = SessionCoordinator::new(params, config, transport, timer);
                run_session(coordinator, inputs_rx, events_tx);
            })?;

        Ok(Self {
            inputs: inputs_tx,
            events: events_rx,
            thread: Some(thread),
            code,
            participant_id,
            connection_state: ConnectionState::Disconnected,
            is_host,
            participants: Vec::new(),
        })
    }

    /// Host a new session under `code`.
    pub fn host<S>(code: SessionCode, name: &str, config: SyncConfig, timer: S) -> Result<Self>
    where
        S: SessionTimer + Send + 'static,
    {
        Self::spawn(SessionParams::host(code, name), config, timer)
    }

    /// Join the session named by `code`.
    pub fn join<S>(code: SessionCode, name: &str, config: SyncConfig, timer: S) -> Result<Self>
    where
        S: SessionTimer + Send + 'static,
    {
        Self::spawn(SessionParams::join(code, name), config, timer)
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    pub fn send_control(&self, action: ControlAction) {
        self.command(Command::SendControl(action));
    }

    pub fn transfer_host(&self, target: ParticipantId) {
        self.command(Command::TransferHost(target));
    }

    /// Leave the session but keep the session thread, so `connect()` can
    /// rejoin later. Like every command this takes effect on the session
    /// thread: a broadcast tick already due may still go out after this
    /// returns. `poll()` reports `ConnectionChanged(Disconnected)` once it
    /// has happened.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Leave the session and stop the session thread.
    pub fn shutdown(self) {}

    /// Drain all session events received since the last call (non-blocking)
    /// and update the mirrored accessors.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let events: Vec<SessionEvent> = self.events.try_iter().collect();
        for event in &events {
            match event {
                SessionEvent::ConnectionChanged(state) => self.connection_state = *state,
                SessionEvent::ParticipantsChanged(participants) => {
                    self.participants = participants.clone();
                }
                SessionEvent::HostChanged(is_host) => self.is_host = *is_host,
                SessionEvent::StateChanged => {}
            }
        }
        events
    }

    pub fn session_code(&self) -> &SessionCode {
        &self.code
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Connection state as of the last `poll()`.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Role as of the last `poll()`.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Roster as of the last `poll()`.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Roster without this participant, for choosing a transfer target.
    pub fn other_participants(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.id != self.participant_id)
            .cloned()
            .collect()
    }

    fn command(&self, command: Command) {
        if self.inputs.send(Input::Command(command)).is_err() {
            debug!("session thread has exited, command dropped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Command(Command::Shutdown));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Session thread body. Runs until `Shutdown`.
fn run_session<S: SessionTimer>(
    mut coordinator: WsCoordinator<S>,
    inputs: Receiver<Input>,
    events: Sender<SessionEvent>,
) {
    loop {
        let input = match coordinator.next_deadline() {
            Some(deadline) => {
                inputs.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => inputs.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        let keep_running = match input {
            Ok(input) => handle_input(&mut coordinator, input),
            // A deadline passed; timers fire below.
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                coordinator.disconnect(Instant::now());
                false
            }
        };

        coordinator.poll_timers(Instant::now());
        for event in coordinator.drain_events() {
            // The owner may have stopped listening; keep running regardless.
            let _ = events.send(event);
        }

        if !keep_running {
            debug!("session loop stopped");
            break;
        }
    }
}

/// Apply one input. Returns `false` when the loop should stop.
fn handle_input<S: SessionTimer>(coordinator: &mut WsCoordinator<S>, input: Input) -> bool {
    let now = Instant::now();
    match input {
        Input::Transport(event) => coordinator.handle_transport_event(event, now),
        Input::Command(command) => {
            debug!(?command, "session command");
            match command {
                Command::Connect => coordinator.connect(now),
                Command::SendControl(action) => coordinator.send_control(action),
                Command::TransferHost(target) => coordinator.transfer_host(&target),
                Command::Disconnect => coordinator.disconnect(now),
                Command::Shutdown => {
                    coordinator.disconnect(now);
                    return false;
                }
            }
        }
    }
    true
}
