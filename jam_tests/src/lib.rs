// Test-only session client and relay for end-to-end jam session tests.
//
// `TestParticipant` wraps the real `SessionHandle` (from `jam_sync::runtime`)
// and a shared `TestTimer`, adding blocking `poll_until_*` helpers so tests
// can wait for a condition instead of sleeping. Everything below the handle
// (coordinator, reconnecting connection, WebSocket transport) is the same
// code an application uses.
//
// `relay` is a small in-process relay that speaks the jam wire protocol over
// real WebSockets on 127.0.0.1.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

pub mod relay;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use jam_protocol::types::{ConnectionState, ControlAction, ParticipantId, SessionCode};
use jam_sync::{SessionEvent, SessionHandle, SessionParams, SessionTimer, SyncConfig};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Install a test-friendly `tracing` subscriber once per process. Filter with
/// `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Sync settings for a local relay: fast broadcasts and short backoff.
pub fn test_config(addr: SocketAddr) -> SyncConfig {
    SyncConfig {
        server: Some(format!("ws://{addr}")),
        state_sync_interval_ms: 50,
        max_reconnect_attempts: 3,
        reconnect_delay_base_ms: 50,
        ..SyncConfig::default()
    }
}

/// Timer snapshot as a Pomodoro timer would share it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub phase: String,
    pub remaining_secs: u32,
    pub running: bool,
}

/// In-memory timer that records what the session did to it.
#[derive(Debug, Default)]
pub struct TestTimer {
    pub state: TimerSnapshot,
    pub jam_mode: bool,
    /// Number of snapshots applied from outside.
    pub applied: usize,
}

impl SessionTimer for TestTimer {
    type State = TimerSnapshot;

    fn get_state(&self) -> TimerSnapshot {
        self.state.clone()
    }

    fn set_state(&mut self, state: TimerSnapshot) {
        self.state = state;
        self.applied += 1;
    }

    fn set_jam_mode(&mut self, enabled: bool) {
        self.jam_mode = enabled;
    }
}

/// A session member driven by a real `SessionHandle`.
pub struct TestParticipant {
    handle: SessionHandle,
    timer: Arc<Mutex<TestTimer>>,
    /// Every event seen by `poll()` since the last `clear_events()`.
    pub events: Vec<SessionEvent>,
}

impl TestParticipant {
    /// Host `code` and start connecting.
    pub fn host(config: SyncConfig, code: &str, name: &str) -> Self {
        Self::start(SessionParams::host(SessionCode::from(code), name), config)
    }

    /// Join `code` and start connecting.
    pub fn join(config: SyncConfig, code: &str, name: &str) -> Self {
        Self::start(SessionParams::join(SessionCode::from(code), name), config)
    }

    fn start(params: SessionParams, config: SyncConfig) -> Self {
        let timer = Arc::new(Mutex::new(TestTimer::default()));
        let handle = SessionHandle::spawn(params, config, timer.clone())
            .expect("failed to spawn session thread");
        handle.connect();
        Self {
            handle,
            timer,
            events: Vec::new(),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> &ParticipantId {
        self.handle.participant_id()
    }

    /// Non-blocking: drain pending events into `events`.
    pub fn poll(&mut self) {
        let events = self.handle.poll();
        self.events.extend(events);
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn saw(&self, event: &SessionEvent) -> bool {
        self.events.contains(event)
    }

    /// Blocking poll until `predicate` holds. Panics after `POLL_TIMEOUT`.
    pub fn poll_until(&mut self, what: &str, predicate: impl Fn(&Self) -> bool) {
        let start = Instant::now();
        loop {
            self.poll();
            if predicate(self) {
                return;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn poll_until_state(&mut self, state: ConnectionState) {
        self.poll_until(&format!("connection state {state}"), |p| {
            p.handle.connection_state() == state
        });
    }

    pub fn poll_until_connected(&mut self) {
        self.poll_until_state(ConnectionState::Connected);
    }

    /// Wait for a roster of exactly `len` members.
    pub fn poll_until_roster(&mut self, len: usize) {
        self.poll_until(&format!("roster of {len}"), |p| {
            p.handle.participants().len() == len
        });
    }

    pub fn poll_until_host(&mut self, is_host: bool) {
        self.poll_until(&format!("host flag {is_host}"), |p| {
            p.handle.is_host() == is_host
        });
    }

    /// Wait until the local timer holds `snapshot`.
    pub fn poll_until_timer(&mut self, snapshot: &TimerSnapshot) {
        self.poll_until("timer snapshot", |p| p.timer_state() == *snapshot);
    }

    pub fn set_timer(&self, snapshot: TimerSnapshot) {
        self.lock_timer().state = snapshot;
    }

    pub fn timer_state(&self) -> TimerSnapshot {
        self.lock_timer().state.clone()
    }

    pub fn jam_mode(&self) -> bool {
        self.lock_timer().jam_mode
    }

    pub fn snapshots_applied(&self) -> usize {
        self.lock_timer().applied
    }

    pub fn send_control(&self, action: ControlAction) {
        self.handle.send_control(action);
    }

    pub fn transfer_host(&self, target: &ParticipantId) {
        self.handle.transfer_host(target.clone());
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    pub fn connect(&self) {
        self.handle.connect();
    }

    /// Leave the session and stop the session thread.
    pub fn shutdown(self) {
        self.handle.shutdown();
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, TestTimer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
