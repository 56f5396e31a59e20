//! Duplex data-pump pieces.
//!
//! A [`Piece`] has one inbound entry point ([`Piece::accept_inbound`]) and one
//! outbound [`Port`]. Pieces know nothing about each other; [`couple`] wires
//! the port of one into the inbound side of another.
//!
//! Locking rule: a piece usually lives behind `Arc<Mutex<_>>`. [`Port::disconnect`]
//! invokes the observer synchronously, and the observer installed by the coupler
//! locks both pieces, so `disconnect` must never run while the piece's own lock
//! is held. `accept_disconnect` implementations only call [`Port::close`].

mod coupler;
pub mod stream;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

pub use coupler::{couple, Coupling};

pub type DisconnectObserver = Box<dyn FnOnce() + Send>;

pub trait Piece: Send + 'static {
    /// Outbound side: registered sink and disconnect observer.
    fn port(&self) -> &Port;

    /// Delivers bytes produced by the coupled peer. Must not block.
    fn accept_inbound(&mut self, data: Bytes);

    /// The peer is gone. Idempotent; no emission happens afterwards.
    fn accept_disconnect(&mut self);

    /// Queue that bytes given to `accept_inbound` end up in, if any.
    fn inbound_backlog(&self) -> Option<Backlog> {
        None
    }
}

/// Where a piece's outbound bytes go.
pub struct Sink {
    deliver: Box<dyn FnMut(Bytes) + Send>,
    backlog: Option<Backlog>,
}

impl Sink {
    pub fn new(deliver: impl FnMut(Bytes) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(deliver),
            backlog: None,
        }
    }

    pub fn with_backlog(mut self, backlog: Backlog) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn deliver(&mut self, data: Bytes) {
        (self.deliver)(data)
    }

    pub fn backlog(&self) -> Option<&Backlog> {
        self.backlog.as_ref()
    }
}

/// Byte count of a write queue with a high watermark.
///
/// Producers add before enqueueing, the writer releases after the bytes hit
/// the transport. Readers feeding the queue wait in [`Backlog::wait_writable`]
/// so a slow consumer stalls the reader and TCP flow control takes over.
#[derive(Clone)]
pub struct Backlog {
    inner: Arc<BacklogInner>,
}

struct BacklogInner {
    queued: AtomicUsize,
    high_watermark: usize,
    drained: Notify,
}

impl Backlog {
    pub fn new(high_watermark: usize) -> Self {
        Self {
            inner: Arc::new(BacklogInner {
                queued: AtomicUsize::new(0),
                high_watermark,
                drained: Notify::new(),
            }),
        }
    }

    pub fn add(&self, n: usize) {
        self.inner.queued.fetch_add(n, Ordering::AcqRel);
    }

    pub fn release(&self, n: usize) {
        self.inner.queued.fetch_sub(n, Ordering::AcqRel);
        self.inner.drained.notify_waiters();
    }

    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.queued() <= self.inner.high_watermark
    }

    pub async fn wait_writable(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.is_writable() {
                return;
            }
            drained.await;
        }
    }
}

/// Outbound half of a piece.
///
/// Holds at most one sink and one observer, each set once. Cloning yields a
/// handle to the same port, so transport tasks can emit without locking the
/// piece itself.
#[derive(Clone, Default)]
pub struct Port {
    shared: Arc<PortShared>,
}

#[derive(Default)]
struct PortShared {
    sink: Mutex<Option<Sink>>,
    observer: Mutex<Option<DisconnectObserver>>,
    closed: AtomicBool,
    changed: Notify,
}

impl Port {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics if a sink is already wired.
    pub fn set_outbound_sink(&self, sink: Sink) {
        let mut slot = self.shared.sink.lock();
        assert!(slot.is_none(), "outbound sink wired twice");
        *slot = Some(sink);
        drop(slot);
        self.shared.changed.notify_waiters();
    }

    /// Panics if an observer is already registered. A port that is already
    /// closed invokes the observer immediately.
    pub fn set_disconnect_observer(&self, observer: DisconnectObserver) {
        let mut slot = self.shared.observer.lock();
        if self.is_closed() {
            drop(slot);
            observer();
            return;
        }
        assert!(slot.is_none(), "disconnect observer registered twice");
        *slot = Some(observer);
    }

    pub fn is_wired(&self) -> bool {
        self.shared.sink.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Hands `data` to the sink. Returns `false` (dropping the bytes) when the
    /// port is closed or not wired yet.
    pub fn emit(&self, data: Bytes) -> bool {
        let mut slot = self.shared.sink.lock();
        if self.is_closed() {
            return false;
        }
        match slot.as_mut() {
            Some(sink) => {
                sink.deliver(data);
                true
            }
            None => false,
        }
    }

    /// Waits until the port is wired and the sink's backlog is below its
    /// watermark. Returns `false` once the port is closed.
    pub async fn reserve(&self) -> bool {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.is_closed() {
                return false;
            }
            let wired = {
                let slot = self.shared.sink.lock();
                slot.as_ref().map(|sink| sink.backlog().cloned())
            };
            match wired {
                None => changed.await,
                Some(None) => return true,
                Some(Some(backlog)) if backlog.is_writable() => return true,
                Some(Some(backlog)) => {
                    tokio::select! {
                        _ = backlog.wait_writable() => {}
                        _ = changed.as_mut() => {}
                    }
                }
            }
        }
    }

    /// Local-origin disconnect: closes the port and fires the observer.
    /// Only the first call (or a prior [`Port::close`]) counts; later calls
    /// return `false`.
    pub fn disconnect(&self) -> bool {
        let observer = {
            let mut slot = self.shared.observer.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.take()
        };
        self.shared.changed.notify_waiters();
        if let Some(observer) = observer {
            observer();
        }
        true
    }

    /// Remote-origin disconnect: closes the port without notifying anyone.
    pub fn close(&self) {
        let slot = self.shared.observer.lock();
        self.shared.closed.store(true, Ordering::Release);
        drop(slot);
        self.shared.changed.notify_waiters();
    }
}
