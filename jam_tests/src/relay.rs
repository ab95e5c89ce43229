// In-process WebSocket relay for end-to-end session tests.
//
// Plays the part of the hosted relay: clients connect to
// `/party/<code>?_pk=<id>&name=<name>&isHost=<bool>`, and the relay keeps one
// room per session code, decides who hosts, broadcasts the roster, and fans
// out host traffic.
//
// Architecture: thread-per-client with a central `mpsc` channel.
//
// - **Listener thread**: non-blocking `accept()` loop that hands each new
//   `TcpStream` to its own client thread.
// - **Client threads**: perform the WebSocket handshake (capturing the request
//   path), report `Joined` to the main thread, then alternate between a
//   short-timeout read and draining the connection's outbound queue. Any read
//   error or close reports `Disconnected`.
// - **Main thread**: owns every room and is the only place membership changes.
//   It waits with `recv_timeout` so it can notice `keep_running` going false.
//
// Room rules:
// - A member joining a room with no host becomes host. The `isHost` query flag
//   is recorded but not trusted.
// - `state-sync` and `control` frames are forwarded verbatim to everyone else.
// - `transfer-host` is honored only from the current host and only for a
//   member of the same room; anything else earns an `error` reply.
// - When the host leaves or drops, the longest-present remaining member is
//   promoted.
// - Undecodable frames earn an `error` reply and are otherwise ignored.
//
// Tests reach in through `RelayHandle` to drop every socket server-side
// (reconnection tests) or to push raw frames into a room.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jam_protocol::message::{JamMessage, MessageBody};
use jam_protocol::types::{Participant, ParticipantId, SessionCode};
use tracing::{debug, info, warn};
use tungstenite::Message;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

type ConnId = u64;

/// Read timeout on client sockets; bounds outbound latency.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Main loop wakeup interval for checking `keep_running`.
const LOOP_TIMEOUT: Duration = Duration::from_millis(50);

/// Sender id stamped on relay-originated messages.
const RELAY_SENDER: &str = "relay";

enum Outbound {
    Text(String),
    Close,
}

/// Events sent from listener/client threads and the handle to the main thread.
enum InternalEvent {
    Joined {
        conn: ConnId,
        code: SessionCode,
        participant: Participant,
        outbound: Sender<Outbound>,
    },
    MessageFrom {
        conn: ConnId,
        text: String,
    },
    Disconnected {
        conn: ConnId,
    },
    DropConnections,
    Inject {
        code: SessionCode,
        text: String,
    },
}

/// Handle returned by `start_relay` to control the running relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    events: Sender<InternalEvent>,
    thread: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down. Open client
    /// sockets are closed.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Close every client socket from the server side and forget all rooms,
    /// as a relay restart would.
    pub fn drop_connections(&self) {
        let _ = self.events.send(InternalEvent::DropConnections);
    }

    /// Send `text` as-is to every member of the room for `code`.
    pub fn inject_raw(&self, code: &SessionCode, text: &str) {
        let _ = self.events.send(InternalEvent::Inject {
            code: code.clone(),
            text: text.to_owned(),
        });
    }

    fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Configuration for starting a test relay.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// Port to bind on 127.0.0.1. 0 lets the OS pick.
    pub port: u16,
}

/// Start the relay on background threads. Returns a handle for controlling
/// it and the bound address.
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind(("127.0.0.1", config.port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || accept_loop(listener, tx_listener, keep_running_listener));

    let keep_running_main = keep_running.clone();
    let thread = thread::spawn(move || run_relay(rx, keep_running_main));

    info!(%addr, "test relay listening");
    Ok((
        RelayHandle {
            keep_running,
            events: tx,
            thread: Some(thread),
        },
        addr,
    ))
}

fn accept_loop(
    listener: TcpListener,
    events: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    let mut next_conn: ConnId = 1;
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false).ok();
                let conn = next_conn;
                next_conn += 1;
                let events = events.clone();
                let keep_running = keep_running.clone();
                thread::spawn(move || client_loop(stream, conn, events, keep_running));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break,
        }
    }
}

/// One client connection: handshake, then pump frames until either side
/// closes or the relay stops.
fn client_loop(
    stream: TcpStream,
    conn: ConnId,
    events: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    // Don't let a silent client hang the handshake.
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

    let mut target = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        target = Some(request.uri().to_string());
        Ok(response)
    };
    let mut socket = match tungstenite::accept_hdr(stream, callback) {
        Ok(socket) => socket,
        Err(e) => {
            debug!(conn, error = %e, "handshake failed");
            return;
        }
    };

    let Some((code, participant)) = target.as_deref().and_then(parse_join) else {
        warn!(conn, target = ?target, "rejecting connection without a party path");
        let _ = socket.close(None);
        let _ = socket.flush();
        return;
    };
    socket
        .get_ref()
        .set_read_timeout(Some(IO_POLL_INTERVAL))
        .ok();

    let (outbound_tx, outbound) = mpsc::channel();
    let joined = InternalEvent::Joined {
        conn,
        code,
        participant,
        outbound: outbound_tx,
    };
    if events.send(joined).is_err() {
        return;
    }

    while keep_running.load(Ordering::SeqCst) {
        loop {
            match outbound.try_recv() {
                Ok(Outbound::Text(text)) => {
                    if socket.send(Message::text(text)).is_err() {
                        let _ = events.send(InternalEvent::Disconnected { conn });
                        return;
                    }
                }
                Ok(Outbound::Close) | Err(TryRecvError::Disconnected) => {
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    let _ = events.send(InternalEvent::Disconnected { conn });
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                let text = text.as_str().to_owned();
                let _ = events.send(InternalEvent::MessageFrom { conn, text });
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(_) => {
                let _ = events.send(InternalEvent::Disconnected { conn });
                return;
            }
        }
    }

    let _ = socket.close(None);
    let _ = socket.flush();
}

/// Parse `/party/<code>?_pk=<id>&name=<name>&isHost=<bool>`.
fn parse_join(target: &str) -> Option<(SessionCode, Participant)> {
    let url = Url::parse(&format!("ws://relay.invalid{target}")).ok()?;
    let mut segments = url.path_segments()?;
    if segments.next()? != "party" {
        return None;
    }
    let code = segments.next().filter(|code| !code.is_empty())?;

    let mut id = None;
    let mut name = String::new();
    let mut is_host = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "_pk" => id = Some(value.into_owned()),
            "name" => name = value.into_owned(),
            "isHost" => is_host = value == "true",
            _ => {}
        }
    }
    let id = id.filter(|id| !id.is_empty())?;

    Some((
        SessionCode::from(code),
        Participant {
            id: ParticipantId(id),
            name,
            is_host,
        },
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(events: Receiver<InternalEvent>, keep_running: Arc<AtomicBool>) {
    let mut relay = Relay::default();
    while keep_running.load(Ordering::SeqCst) {
        match events.recv_timeout(LOOP_TIMEOUT) {
            Ok(event) => relay.handle_event(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("test relay stopped");
}

struct Member {
    conn: ConnId,
    participant: Participant,
    outbound: Sender<Outbound>,
}

#[derive(Default)]
struct Room {
    /// In join order; index 0 is the failover candidate.
    members: Vec<Member>,
}

impl Room {
    fn has_host(&self) -> bool {
        self.members.iter().any(|m| m.participant.is_host)
    }

    fn member(&self, conn: ConnId) -> Option<&Member> {
        self.members.iter().find(|m| m.conn == conn)
    }

    fn send_to(&self, conn: ConnId, text: &str) {
        if let Some(member) = self.member(conn) {
            let _ = member.outbound.send(Outbound::Text(text.to_owned()));
        }
    }

    fn send_all(&self, text: &str) {
        for member in &self.members {
            let _ = member.outbound.send(Outbound::Text(text.to_owned()));
        }
    }

    /// Send `text` to everyone except `from`.
    fn forward(&self, from: ConnId, text: &str) {
        for member in self.members.iter().filter(|m| m.conn != from) {
            let _ = member.outbound.send(Outbound::Text(text.to_owned()));
        }
    }

    fn broadcast_roster(&self) {
        let participants = self.members.iter().map(|m| m.participant.clone()).collect();
        if let Some(text) = relay_message(MessageBody::ParticipantUpdate { participants }) {
            self.send_all(&text);
        }
    }

    fn reply_error(&self, conn: ConnId, message: &str) {
        let body = MessageBody::Error {
            message: message.to_owned(),
        };
        if let Some(text) = relay_message(body) {
            self.send_to(conn, &text);
        }
    }
}

fn relay_message(body: MessageBody) -> Option<String> {
    let message = JamMessage::new(
        ParticipantId::from(RELAY_SENDER),
        jam_sync::now_millis(),
        body,
    );
    match jam_protocol::encode(&message) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "cannot encode relay message");
            None
        }
    }
}

#[derive(Default)]
struct Relay {
    rooms: HashMap<SessionCode, Room>,
    /// Room of every joined connection.
    conns: HashMap<ConnId, SessionCode>,
}

impl Relay {
    fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Joined {
                conn,
                code,
                participant,
                outbound,
            } => self.join(conn, code, participant, outbound),
            InternalEvent::MessageFrom { conn, text } => self.handle_frame(conn, &text),
            InternalEvent::Disconnected { conn } => self.remove(conn),
            InternalEvent::DropConnections => self.drop_all(),
            InternalEvent::Inject { code, text } => {
                if let Some(room) = self.rooms.get(&code) {
                    room.send_all(&text);
                }
            }
        }
    }

    fn join(
        &mut self,
        conn: ConnId,
        code: SessionCode,
        mut participant: Participant,
        outbound: Sender<Outbound>,
    ) {
        let room = self.rooms.entry(code.clone()).or_default();

        // A reconnect can beat the old socket's disconnect; retire the stale entry.
        let (stale, kept): (Vec<Member>, Vec<Member>) = std::mem::take(&mut room.members)
            .into_iter()
            .partition(|m| m.participant.id == participant.id);
        room.members = kept;
        for member in stale {
            self.conns.remove(&member.conn);
            let _ = member.outbound.send(Outbound::Close);
        }

        let claimed_host = participant.is_host;
        participant.is_host = !room.has_host();
        info!(
            session = %code,
            participant = %participant.id,
            claimed_host,
            host = participant.is_host,
            "member joined"
        );
        room.members.push(Member {
            conn,
            participant,
            outbound,
        });
        room.broadcast_roster();
        self.conns.insert(conn, code);
    }

    fn handle_frame(&mut self, conn: ConnId, text: &str) {
        let Some(code) = self.conns.get(&conn).cloned() else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&code) else {
            return;
        };

        let message = match jam_protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session = %code, conn, error = %e, "undecodable frame");
                room.reply_error(conn, "malformed message");
                return;
            }
        };

        match &message.body {
            MessageBody::StateSync { .. } | MessageBody::Control { .. } => room.forward(conn, text),
            MessageBody::TransferHost { new_host_id } => {
                let from_host = room.member(conn).is_some_and(|m| m.participant.is_host);
                let target_known = room.members.iter().any(|m| m.participant.id == *new_host_id);
                if !from_host {
                    room.reply_error(conn, "only the host can transfer the host role");
                } else if !target_known {
                    room.reply_error(conn, "no such participant");
                } else {
                    info!(session = %code, new_host = %new_host_id, "host transferred");
                    for member in &mut room.members {
                        member.participant.is_host = member.participant.id == *new_host_id;
                    }
                    room.broadcast_roster();
                }
            }
            MessageBody::Leave => self.remove(conn),
            MessageBody::Join { .. } => {
                // Identity comes from the connection URL.
                debug!(session = %code, conn, "join noted");
            }
            MessageBody::ParticipantUpdate { .. } | MessageBody::Error { .. } => {
                debug!(session = %code, conn, kind = message.body.kind(), "relay-only message from client ignored");
            }
        }
    }

    /// Remove a connection's member, close its socket, and promote a new host
    /// if needed.
    fn remove(&mut self, conn: ConnId) {
        let Some(code) = self.conns.remove(&conn) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&code) else {
            return;
        };
        let Some(index) = room.members.iter().position(|m| m.conn == conn) else {
            return;
        };

        let member = room.members.remove(index);
        let _ = member.outbound.send(Outbound::Close);
        info!(session = %code, participant = %member.participant.id, "member left");

        if room.members.is_empty() {
            self.rooms.remove(&code);
            return;
        }
        if member.participant.is_host {
            let next = &mut room.members[0];
            next.participant.is_host = true;
            info!(session = %code, new_host = %next.participant.id, "host promoted");
        }
        room.broadcast_roster();
    }

    fn drop_all(&mut self) {
        info!(rooms = self.rooms.len(), "dropping every connection");
        for room in self.rooms.values() {
            for member in &room.members {
                let _ = member.outbound.send(Outbound::Close);
            }
        }
        self.rooms.clear();
        self.conns.clear();
    }
}
