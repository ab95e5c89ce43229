// Transport seam between the connection state machine and the network.
//
// `ReconnectingConnection` only needs three operations (open a socket to a
// URL, send a text frame, close) and one inbound stream of events. The
// `Transport` trait captures exactly that. Events are not returned from the
// trait methods; they are posted asynchronously into the owner's channel,
// each tagged with the *epoch* the connection assigned when it asked for the
// open. The connection ignores events from any epoch but the current one, so
// a late `Closed` from a socket it already abandoned cannot start a retry.
//
// `WsTransport` is the production implementation on blocking `tungstenite`.
// Each open spawns one I/O thread that owns the socket:
// - It performs the WebSocket handshake, then posts `Opened` (or `Closed` if
//   the handshake fails).
// - It alternates between a short-timeout read and draining an outbound
//   `mpsc` queue, because a blocking tungstenite socket cannot be split into
//   independent read and write halves.
// - When the socket dies it posts `Closed` and exits. When the owner closes
//   it, it sends a close frame and exits without posting anything.
//
// The owner's channel is generic over `E: From<TransportEvent>` so the runtime
// can multiplex transport events and its own commands on a single receiver.

use std::io;
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::Request;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::error::{Result, SyncError};

/// How long the I/O thread blocks in a read before checking its outbound
/// queue. Bounds the added latency of a send.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Something that happened on a socket, tagged with the socket's epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Handshake completed; frames can flow.
    Opened,
    /// One inbound text frame, undecoded.
    Message(String),
    /// The socket failed to open or dropped.
    Closed,
}

/// A text-frame socket to the relay.
pub trait Transport {
    /// Start opening a socket to `url`, replacing any current one. Returns an
    /// error only when the request cannot be built at all; network failures
    /// arrive later as a `Closed` event for `epoch`.
    fn open(&mut self, url: &Url, epoch: u64) -> Result<()>;

    /// Queue one text frame on the current socket.
    fn send(&mut self, text: String) -> Result<()>;

    /// Tear down the current socket, if any. Posts no event.
    fn close(&mut self);
}

enum Outbound {
    Text(String),
    Close,
}

/// WebSocket transport on blocking `tungstenite` with one I/O thread per
/// socket.
pub struct WsTransport<E> {
    sink: Sender<E>,
    outbound: Option<Sender<Outbound>>,
}

impl<E> WsTransport<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    /// Create a transport that posts its events into `sink`.
    pub fn new(sink: Sender<E>) -> Self {
        Self {
            sink,
            outbound: None,
        }
    }
}

impl<E> Transport for WsTransport<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    fn open(&mut self, url: &Url, epoch: u64) -> Result<()> {
        self.close();

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let sink = self.sink.clone();

        thread::Builder::new()
            .name(format!("jam-socket-{epoch}"))
            .spawn(move || socket_loop(request, epoch, sink, outbound_rx))?;

        self.outbound = Some(outbound_tx);
        Ok(())
    }

    fn send(&mut self, text: String) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| SyncError::Transport("no open socket".into()))?;
        outbound
            .send(Outbound::Text(text))
            .map_err(|_| SyncError::Transport("socket thread has exited".into()))
    }

    fn close(&mut self) {
        self.close_socket();
    }
}

impl<E> WsTransport<E> {
    /// Ask the I/O thread, if any, to send a close frame and exit.
    fn close_socket(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
    }
}

impl<E> Drop for WsTransport<E> {
    fn drop(&mut self) {
        self.close_socket();
    }
}

/// I/O thread body: handshake, then pump frames until either side closes.
fn socket_loop<E: From<TransportEvent>>(
    request: Request,
    epoch: u64,
    sink: Sender<E>,
    outbound: Receiver<Outbound>,
) {
    let emit = |kind| {
        let _ = sink.send(E::from(TransportEvent { epoch, kind }));
    };

    let uri = request.uri().to_string();
    let mut socket = match tungstenite::connect(request) {
        Ok((socket, _response)) => socket,
        Err(e) => {
            warn!(epoch, %uri, error = %e, "relay connection failed");
            emit(TransportEventKind::Closed);
            return;
        }
    };
    if let Err(e) = set_read_timeout(&socket, Some(IO_POLL_INTERVAL)) {
        warn!(epoch, error = %e, "could not set socket read timeout");
        let _ = socket.close(None);
        emit(TransportEventKind::Closed);
        return;
    }

    info!(epoch, %uri, "relay socket open");
    emit(TransportEventKind::Opened);

    loop {
        // Flush everything queued since the last read.
        loop {
            match outbound.try_recv() {
                Ok(Outbound::Text(text)) => {
                    if let Err(e) = socket.send(Message::text(text)) {
                        debug!(epoch, error = %e, "send failed, dropping socket");
                        emit(TransportEventKind::Closed);
                        return;
                    }
                }
                Ok(Outbound::Close) | Err(TryRecvError::Disconnected) => {
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    debug!(epoch, "relay socket closed by owner");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => emit(TransportEventKind::Message(text.as_str().to_owned())),
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                info!(epoch, reason = %e, "relay socket dropped");
                emit(TransportEventKind::Closed);
                return;
            }
        }
    }
}

fn set_read_timeout(
    socket: &WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) -> io::Result<()> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
        MaybeTlsStream::NativeTls(stream) => stream.get_ref().set_read_timeout(timeout),
        _ => Ok(()),
    }
}
