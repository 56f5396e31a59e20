use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use slog::{debug, error, info, o};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::session::{drive, CloseReason, SessionEvent, SocksSession};
use super::{Destination, Reply};
use crate::config::Config;
use crate::control::{Control, Lifecycle};
use crate::forward::{Connector, ForwardingSocket};
use crate::piece::couple;

pub type ConnId = u64;

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub client_addr: SocketAddr,
    pub destination: Option<Destination>,
    pub relaying: bool,
    pub started_at: Instant,
}

/// Live connections, keyed by id. Entries go away when the session closes.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<ConnId, ConnectionInfo>>>,
}

impl Registry {
    fn register(&self, id: ConnId, client_addr: SocketAddr) -> Registration {
        self.inner.lock().insert(
            id,
            ConnectionInfo {
                client_addr,
                destination: None,
                relaying: false,
                started_at: Instant::now(),
            },
        );
        Registration {
            registry: self.clone(),
            id,
        }
    }

    fn update(&self, id: ConnId, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(info) = self.inner.lock().get_mut(&id) {
            f(info);
        }
    }

    pub fn snapshot(&self) -> Vec<(ConnId, ConnectionInfo)> {
        let mut list: Vec<_> = self
            .inner
            .lock()
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Registration {
    registry: Registry,
    id: ConnId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.inner.lock().remove(&self.id);
    }
}

pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    control: Arc<dyn Control>,
    connector: Arc<dyn Connector>,
    registry: Registry,
    logger: slog::Logger,
}

impl Server {
    pub async fn bind(
        config: Config,
        control: Arc<dyn Control>,
        connector: Arc<dyn Connector>,
        logger: slog::Logger,
    ) -> anyhow::Result<Self> {
        let addr = (config.listen_addr.as_str(), config.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}:{}: {e}", addr.0, addr.1))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            control,
            connector,
            registry: Registry::default(),
            logger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> Vec<(ConnId, ConnectionInfo)> {
        self.registry.snapshot()
    }

    /// Handle that outlives [`Server::serve`].
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(self.logger, "server started"; "addr" => %addr);

        let mut conn_id = 0;
        loop {
            match self.listener.accept().await {
                Ok((conn, addr)) => {
                    conn_id += 1;
                    let h = Handler {
                        id: conn_id,
                        config: self.config.clone(),
                        control: self.control.clone(),
                        connector: self.connector.clone(),
                        registry: self.registry.clone(),
                        logger: self.logger.new(o!("id" => conn_id)),
                    };
                    tokio::spawn(h.handle(conn, addr));
                }
                Err(err) => {
                    error!(self.logger, "failed to accept"; "err" => %err);
                }
            }
        }
    }
}

struct Handler {
    id: ConnId,
    config: Arc<Config>,
    control: Arc<dyn Control>,
    connector: Arc<dyn Connector>,
    registry: Registry,
    logger: slog::Logger,
}

impl Handler {
    async fn handle(self, client: TcpStream, client_addr: SocketAddr) {
        let started_at = Instant::now();
        info!(self.logger, "proxy start"; "client_addr" => %client_addr);
        let _registration = self.registry.register(self.id, client_addr);
        if let Err(e) = client.set_nodelay(true) {
            debug!(self.logger, "set_nodelay failed"; "err" => %e);
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let session = SocksSession::spawn(
            client,
            events_tx,
            self.config.max_pending_bytes,
            self.config.write_high_watermark,
            self.logger.new(o!("piece" => "session")),
        );

        let mut coupling = None;
        let reason = loop {
            let destination = match events.recv().await {
                Some(SessionEvent::Resolved(destination)) => destination,
                Some(SessionEvent::Closed(reason)) => break reason,
                None => break CloseReason::ClientClosed,
            };
            if coupling.is_some() {
                error!(self.logger, "destination resolved twice"; "dest" => %destination);
                continue;
            }
            self.registry
                .update(self.id, |info| info.destination = Some(destination.clone()));
            self.control
                .notify(self.id, Lifecycle::Resolved(destination.clone()));

            let outcome = tokio::select! {
                outcome = self.open(&destination) => outcome,
                reason = next_close(&mut events) => break reason,
            };
            match outcome {
                Ok(forward) => {
                    let forward = Arc::new(Mutex::new(forward));
                    coupling = Some(couple(session.clone(), forward));
                    if drive(&session, |s| s.connect_succeeded()) {
                        info!(self.logger, "relay established"; "dest" => %destination);
                        self.registry.update(self.id, |info| info.relaying = true);
                        self.control
                            .notify(self.id, Lifecycle::Established(destination));
                    }
                }
                Err(reply) => {
                    drive(&session, |s| s.connect_failed(reply));
                }
            }
        };

        drop(coupling);
        let (uploaded_bytes, downloaded_bytes) = session.lock().transferred();
        info!(self.logger, "proxy done";
            "reason" => %reason,
            "downloaded_bytes" => downloaded_bytes,
            "uploaded_bytes" => uploaded_bytes,
            "elapsed" => ?started_at.elapsed(),
        );
        self.control.notify(self.id, Lifecycle::Closed(reason));
    }

    /// Policy check, then connect with the configured timeout. The error is
    /// the reply owed to the client.
    async fn open(&self, destination: &Destination) -> Result<ForwardingSocket, Reply> {
        if !self.control.authorize(self.id, destination).await {
            info!(self.logger, "destination denied"; "dest" => %destination);
            return Err(Reply::NotAllowed);
        }

        let mut forward = ForwardingSocket::new(
            self.connector.clone(),
            self.config.write_high_watermark,
            self.logger.new(o!("piece" => "forward")),
        );
        match forward
            .connect(destination, self.config.connect_timeout())
            .await
        {
            Ok(()) => Ok(forward),
            Err(e) => {
                info!(self.logger, "connect failed"; "dest" => %destination, "err" => %e);
                Err(e.reply())
            }
        }
    }
}

/// Waits for the session to report its end, skipping anything else.
async fn next_close(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> CloseReason {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Closed(reason) = event {
            return reason;
        }
    }
    CloseReason::ClientClosed
}
