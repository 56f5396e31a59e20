//! Client-facing SOCKS5 state machine.
//!
//! The session has two faces. The client face takes raw client bytes
//! ([`SocksSession::accept_client`]) and writes replies and relayed data to
//! the client sink. The [`Piece`] face is the coupled peer: client bytes leave
//! through the port once relaying, peer bytes come back via `accept_inbound`.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use slog::{debug, error, info, o};
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::codec::{self, Destination, ProtocolError, Reply};
use super::{METHOD_NONE_ACCEPTABLE, METHOD_NO_AUTH};
use crate::piece::stream::{read_chunk, Outbox};
use crate::piece::{Backlog, Piece, Port, Sink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `VER NMETHODS`.
    Init,
    /// Waiting for the method list announced in the greeting.
    AwaitMethods { count: usize },
    AwaitRequest,
    /// Destination handed to the server; client bytes are held back.
    AwaitConnectResult,
    Relaying,
    Closed,
}

#[derive(Debug)]
pub enum SessionEvent {
    Resolved(Destination),
    Closed(CloseReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ClientError(io::ErrorKind),
    PeerClosed,
    Protocol(ProtocolError),
    ConnectFailed(Reply),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::ClientError(kind) => write!(f, "client transport error: {}", kind),
            Self::PeerClosed => f.write_str("destination closed"),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::ConnectFailed(reply) => write!(f, "connect failed: {:?}", reply),
        }
    }
}

pub struct SocksSession {
    state: SessionState,
    pending: BytesMut,
    /// Peer bytes that raced ahead of the success reply. Counted against
    /// the client backlog so the peer's reader stalls like it would later.
    held: SmallVec<[Bytes; 2]>,
    /// Peer went away before the success reply was written.
    peer_closed: bool,
    max_pending: usize,
    client: Option<Sink>,
    client_backlog: Option<Backlog>,
    port: Port,
    events: mpsc::UnboundedSender<SessionEvent>,
    tasks: SmallVec<[AbortHandle; 1]>,
    uploaded: u64,
    downloaded: u64,
    logger: slog::Logger,
}

impl SocksSession {
    pub fn new(
        client: Sink,
        events: mpsc::UnboundedSender<SessionEvent>,
        max_pending: usize,
        logger: slog::Logger,
    ) -> Self {
        let client_backlog = client.backlog().cloned();
        Self {
            state: SessionState::Init,
            pending: BytesMut::new(),
            held: SmallVec::new(),
            peer_closed: false,
            max_pending,
            client: Some(client),
            client_backlog,
            port: Port::new(),
            events,
            tasks: SmallVec::new(),
            uploaded: 0,
            downloaded: 0,
            logger,
        }
    }

    /// Binds a session to a client stream: a writer task drains replies and
    /// relayed bytes, a reader task feeds [`SocksSession::accept_client`].
    pub fn spawn<S>(
        stream: S,
        events: mpsc::UnboundedSender<SessionEvent>,
        max_pending: usize,
        high_watermark: usize,
        logger: slog::Logger,
    ) -> Arc<Mutex<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new_cyclic(|weak: &std::sync::Weak<Mutex<Self>>| {
            let weak = weak.clone();
            let outbox = Outbox::spawn(writer, high_watermark, move |e| {
                if let Some(session) = weak.upgrade() {
                    drive(&session, |s| s.client_closed(Some(e)));
                }
            });
            Mutex::new(Self::new(outbox.into_sink(), events, max_pending, logger))
        });

        let task = tokio::spawn(read_client(reader, session.clone()));
        let mut s = session.lock();
        if s.is_closed() {
            task.abort();
        } else {
            s.tasks.push(task.abort_handle());
        }
        drop(s);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Bytes relayed client → destination and destination → client.
    pub fn transferred(&self) -> (u64, u64) {
        (self.uploaded, self.downloaded)
    }

    /// Client face: raw bytes from the client. Returns `false` once closed.
    pub fn accept_client(&mut self, data: Bytes) -> bool {
        match self.state {
            SessionState::Closed => return false,
            SessionState::Relaying => {
                self.uploaded += data.len() as u64;
                self.port.emit(data);
                return true;
            }
            _ => {}
        }

        self.pending.extend_from_slice(&data);
        loop {
            match self.step() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        // Only bytes still buffered after parsing count toward the limit.
        if !self.is_closed() && self.pending.len() > self.max_pending {
            self.fail(ProtocolError::Overflow);
        }
        !self.is_closed()
    }

    /// Client face: the client went away, cleanly or not.
    pub fn client_closed(&mut self, err: Option<io::Error>) {
        let reason = match err {
            None => CloseReason::ClientClosed,
            Some(e) => CloseReason::ClientError(e.kind()),
        };
        self.close(reason);
    }

    /// Destination reached and coupled: reply success and start relaying.
    /// Returns `false` if the session was not waiting for a connect result.
    pub fn connect_succeeded(&mut self) -> bool {
        if !self.expecting_connect_result("success") {
            return false;
        }
        self.send_client(&codec::reply(Reply::Succeeded));
        self.state = SessionState::Relaying;

        for data in self.take_held() {
            self.downloaded += data.len() as u64;
            if let Some(client) = self.client.as_mut() {
                client.deliver(data);
            }
        }
        if self.peer_closed {
            self.close(CloseReason::PeerClosed);
            return true;
        }
        if !self.pending.is_empty() {
            let early = self.pending.split().freeze();
            self.uploaded += early.len() as u64;
            self.port.emit(early);
        }
        true
    }

    /// Destination unreachable or refused: reply `reply`, then disconnect.
    pub fn connect_failed(&mut self, reply: Reply) -> bool {
        if !self.expecting_connect_result("failure") {
            return false;
        }
        self.send_client(&codec::reply(reply));
        self.close(CloseReason::ConnectFailed(reply));
        true
    }

    fn expecting_connect_result(&self, outcome: &str) -> bool {
        match self.state {
            SessionState::AwaitConnectResult => true,
            SessionState::Closed => false,
            state => {
                error!(self.logger, "unexpected connect result";
                    "outcome" => outcome,
                    "state" => ?state,
                );
                false
            }
        }
    }

    /// Consumes one complete field group from `pending`. `Ok(true)` means
    /// the state changed and another step may be possible.
    fn step(&mut self) -> Result<bool, ProtocolError> {
        match self.state {
            SessionState::Init => {
                let Some(count) = codec::greeting_header(&self.pending)? else {
                    return Ok(false);
                };
                self.pending.advance(2);
                self.state = SessionState::AwaitMethods { count };
                Ok(true)
            }
            SessionState::AwaitMethods { count } => {
                if self.pending.len() < count {
                    return Ok(false);
                }
                let methods = self.pending.split_to(count);
                if !methods.contains(&METHOD_NO_AUTH) {
                    self.send_client(&codec::method_selection(METHOD_NONE_ACCEPTABLE));
                    return Err(ProtocolError::NoAcceptableMethod);
                }
                self.send_client(&codec::method_selection(METHOD_NO_AUTH));
                self.state = SessionState::AwaitRequest;
                Ok(true)
            }
            SessionState::AwaitRequest => {
                let Some((destination, used)) = codec::request(&self.pending)? else {
                    return Ok(false);
                };
                self.pending.advance(used);
                debug!(self.logger, "destination resolved"; "dest" => %destination);
                self.state = SessionState::AwaitConnectResult;
                let _ = self.events.send(SessionEvent::Resolved(destination));
                Ok(false)
            }
            SessionState::AwaitConnectResult | SessionState::Relaying | SessionState::Closed => {
                Ok(false)
            }
        }
    }

    fn fail(&mut self, err: ProtocolError) {
        // Before the greeting is understood there is nobody to reply to; the
        // method rejection is sent by `step` itself.
        if matches!(
            self.state,
            SessionState::AwaitRequest | SessionState::AwaitConnectResult
        ) {
            self.send_client(&codec::reply(err.reply()));
        }
        self.close(CloseReason::Protocol(err));
    }

    fn take_held(&mut self) -> SmallVec<[Bytes; 2]> {
        let held = std::mem::take(&mut self.held);
        if let Some(backlog) = &self.client_backlog {
            backlog.release(held.iter().map(Bytes::len).sum());
        }
        held
    }

    fn send_client(&mut self, frame: &[u8]) {
        if let Some(client) = self.client.as_mut() {
            client.deliver(Bytes::copy_from_slice(frame));
        }
    }

    /// Enters `Closed`. Dropping the client sink lets its writer flush the
    /// last reply before shutting the socket. The port is left to [`drive`]
    /// or to whoever called `accept_disconnect`.
    fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.pending.clear();
        self.take_held();
        self.client = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(self.logger, "session closed";
            "reason" => %reason,
            "uploaded_bytes" => self.uploaded,
            "downloaded_bytes" => self.downloaded,
        );
        let _ = self.events.send(SessionEvent::Closed(reason));
    }
}

impl Piece for SocksSession {
    fn port(&self) -> &Port {
        &self.port
    }

    fn accept_inbound(&mut self, data: Bytes) {
        match self.state {
            SessionState::Relaying => {
                self.downloaded += data.len() as u64;
                if let Some(client) = self.client.as_mut() {
                    client.deliver(data);
                }
            }
            SessionState::AwaitConnectResult => {
                if let Some(backlog) = &self.client_backlog {
                    backlog.add(data.len());
                }
                self.held.push(data);
            }
            _ => {}
        }
    }

    fn accept_disconnect(&mut self) {
        self.port.close();
        if self.state == SessionState::AwaitConnectResult {
            // Coupled but not yet confirmed: the success reply and any held
            // bytes still go out, `connect_succeeded` closes afterwards.
            self.peer_closed = true;
            return;
        }
        self.close(CloseReason::PeerClosed);
    }

    fn inbound_backlog(&self) -> Option<Backlog> {
        self.client_backlog.clone()
    }
}

impl Drop for SocksSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Runs `f` on the locked session, then fires the peer-side disconnect if `f`
/// left the session closed. The port is touched only after the lock is
/// released, since the coupler's observer locks the session again.
pub fn drive<R>(session: &Mutex<SocksSession>, f: impl FnOnce(&mut SocksSession) -> R) -> R {
    let (out, port) = {
        let mut s = session.lock();
        let out = f(&mut s);
        let port = s.is_closed().then(|| s.port.clone());
        (out, port)
    };
    if let Some(port) = port {
        port.disconnect();
    }
    out
}

async fn read_client<R>(mut reader: R, session: Arc<Mutex<SocksSession>>)
where
    R: AsyncRead + Unpin,
{
    let (port, logger) = {
        let s = session.lock();
        (s.port.clone(), s.logger.new(o!("side" => "client")))
    };
    let mut buf = BytesMut::new();
    loop {
        if port.is_wired() && !port.reserve().await {
            break;
        }
        match read_chunk(&mut reader, &mut buf).await {
            Ok(Some(data)) => {
                if !drive(&session, |s| s.accept_client(data)) {
                    break;
                }
            }
            Ok(None) => {
                drive(&session, |s| s.client_closed(None));
                break;
            }
            Err(e) => {
                debug!(logger, "read failed"; "err" => %e);
                drive(&session, |s| s.client_closed(Some(e)));
                break;
            }
        }
    }
}
