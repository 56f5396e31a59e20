//! Piece adapter over the outbound transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use slog::{debug, o};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::AbortHandle;

use crate::piece::stream::{read_chunk, Outbox};
use crate::piece::{Backlog, Piece, Port};
use crate::socks::{Destination, Reply};

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("address type not supported by transport")]
    UnsupportedAddress,
    #[error("connect failed: {0}")]
    Other(#[source] io::Error),
}

impl ConnectError {
    pub fn reply(&self) -> Reply {
        match self {
            Self::Timeout | Self::Other(_) => Reply::GeneralFailure,
            Self::Refused => Reply::ConnectionRefused,
            Self::NetworkUnreachable => Reply::NetworkUnreachable,
            Self::HostUnreachable => Reply::HostUnreachable,
            Self::UnsupportedAddress => Reply::AddressTypeNotSupported,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            io::ErrorKind::HostUnreachable | io::ErrorKind::AddrNotAvailable => {
                Self::HostUnreachable
            }
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Other(err),
        }
    }
}

/// Opens the byte stream a [`ForwardingSocket`] relays over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, ConnectError>;
}

/// Plain TCP to the destination.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectConnector;

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, ConnectError> {
        let addrs: Vec<SocketAddr> = match destination {
            Destination::V4(addr) => vec![(*addr).into()],
            Destination::V6(addr) => vec![(*addr).into()],
            Destination::Domain(host, port) => lookup_host((host.as_str(), *port))
                .await
                .map_err(|_| ConnectError::HostUnreachable)?
                .collect(),
        };

        let mut last_err = ConnectError::HostUnreachable;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }
}

pub struct ForwardingSocket {
    connector: Arc<dyn Connector>,
    port: Port,
    outbox: Option<Outbox>,
    reader: Option<AbortHandle>,
    high_watermark: usize,
    logger: slog::Logger,
}

impl ForwardingSocket {
    pub fn new(connector: Arc<dyn Connector>, high_watermark: usize, logger: slog::Logger) -> Self {
        Self {
            connector,
            port: Port::new(),
            outbox: None,
            reader: None,
            high_watermark,
            logger,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_some()
    }

    /// Opens the transport. The reader starts right away but holds its first
    /// emission until the port is wired.
    pub async fn connect(
        &mut self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        if self.is_connected() || self.port.is_closed() {
            return Err(ConnectError::Other(io::Error::new(
                io::ErrorKind::Other,
                "forwarding socket already used",
            )));
        }

        let stream = tokio::time::timeout(timeout, self.connector.connect(destination))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        debug!(self.logger, "connected"; "dest" => %destination);

        let (reader, writer) = tokio::io::split(stream);
        let port = self.port.clone();
        let logger = self.logger.clone();
        self.outbox = Some(Outbox::spawn(writer, self.high_watermark, move |e| {
            debug!(logger, "write failed"; "err" => %e);
            port.disconnect();
        }));

        let task = tokio::spawn(read_destination(
            reader,
            self.port.clone(),
            self.logger.new(o!("side" => "destination")),
        ));
        self.reader = Some(task.abort_handle());
        Ok(())
    }
}

async fn read_destination(mut reader: ReadHalf<BoxedStream>, port: Port, logger: slog::Logger) {
    let mut buf = BytesMut::new();
    while port.reserve().await {
        match read_chunk(&mut reader, &mut buf).await {
            Ok(Some(data)) => {
                port.emit(data);
            }
            Ok(None) => {
                debug!(logger, "eof");
                break;
            }
            Err(e) => {
                debug!(logger, "read failed"; "err" => %e);
                break;
            }
        }
    }
    port.disconnect();
}

impl Piece for ForwardingSocket {
    fn port(&self) -> &Port {
        &self.port
    }

    fn accept_inbound(&mut self, data: Bytes) {
        if self.port.is_closed() {
            return;
        }
        if let Some(outbox) = &self.outbox {
            outbox.push(data);
        }
    }

    fn accept_disconnect(&mut self) {
        self.port.close();
        self.outbox = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn inbound_backlog(&self) -> Option<Backlog> {
        self.outbox.as_ref().map(|outbox| outbox.backlog().clone())
    }
}

impl Drop for ForwardingSocket {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use slog::Discard;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::piece::couple;

    fn logger() -> slog::Logger {
        slog::Logger::root(Discard, o!())
    }

    fn local(port: u16) -> Destination {
        Destination::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[derive(Default)]
    struct Probe {
        port: Port,
        received: Arc<Mutex<Vec<u8>>>,
        disconnects: Arc<AtomicUsize>,
    }

    impl Piece for Probe {
        fn port(&self) -> &Port {
            &self.port
        }

        fn accept_inbound(&mut self, data: Bytes) {
            self.received.lock().extend_from_slice(&data);
        }

        fn accept_disconnect(&mut self) {
            self.port.close();
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn relays_through_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"banner\n").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut socket = ForwardingSocket::new(Arc::new(DirectConnector), 1 << 16, logger());
        socket.connect(&local(port), Duration::from_secs(5)).await.unwrap();

        let probe = Probe::default();
        let probe_port = probe.port.clone();
        let received = probe.received.clone();
        let disconnects = probe.disconnects.clone();
        let _coupling = couple(Arc::new(Mutex::new(probe)), Arc::new(Mutex::new(socket)));

        assert!(probe_port.emit(Bytes::from_static(b"ping")));
        server.await.unwrap();

        eventually(|| disconnects.load(Ordering::SeqCst) == 1).await;
        assert_eq!(&received.lock()[..], b"banner\nping");
    }

    #[tokio::test]
    async fn refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut socket = ForwardingSocket::new(Arc::new(DirectConnector), 1024, logger());
        let err = socket
            .connect(&local(port), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Refused), "{:?}", err);
        assert_eq!(err.reply(), Reply::ConnectionRefused);
        assert!(!socket.is_connected());
    }

    struct Stalled;

    #[async_trait]
    impl Connector for Stalled {
        async fn connect(&self, _: &Destination) -> Result<BoxedStream, ConnectError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn times_out() {
        let mut socket = ForwardingSocket::new(Arc::new(Stalled), 1024, logger());
        let err = socket
            .connect(&local(9), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout));
        assert_eq!(err.reply(), Reply::GeneralFailure);
    }

    #[tokio::test]
    async fn nothing_is_emitted_before_wiring() {
        let (near, mut far) = tokio::io::duplex(64);
        let stream = Arc::new(Mutex::new(Some(near)));

        struct Once(Arc<Mutex<Option<tokio::io::DuplexStream>>>);

        #[async_trait]
        impl Connector for Once {
            async fn connect(&self, _: &Destination) -> Result<BoxedStream, ConnectError> {
                let stream = self.0.lock().take().ok_or(ConnectError::Refused)?;
                Ok(Box::new(stream))
            }
        }

        let mut socket = ForwardingSocket::new(Arc::new(Once(stream)), 1024, logger());
        socket.connect(&local(1), Duration::from_secs(1)).await.unwrap();
        far.write_all(b"early").await.unwrap();
        drop(far);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe = Probe::default();
        let received = probe.received.clone();
        let disconnects = probe.disconnects.clone();
        let _coupling = couple(Arc::new(Mutex::new(probe)), Arc::new(Mutex::new(socket)));

        eventually(|| disconnects.load(Ordering::SeqCst) == 1).await;
        assert_eq!(&received.lock()[..], b"early");
    }

    #[test]
    fn io_errors_map_to_replies() {
        let refused: ConnectError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused.reply().code(), 0x05);
        let host: ConnectError = io::Error::from(io::ErrorKind::HostUnreachable).into();
        assert_eq!(host.reply().code(), 0x04);
        let net: ConnectError = io::Error::from(io::ErrorKind::NetworkUnreachable).into();
        assert_eq!(net.reply().code(), 0x03);
        let other: ConnectError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(other.reply().code(), 0x01);
        assert_eq!(ConnectError::UnsupportedAddress.reply().code(), 0x08);
    }
}
