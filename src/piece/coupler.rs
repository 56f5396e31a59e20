use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Backlog, DisconnectObserver, Piece, Sink};

/// Two pieces wired back to back.
///
/// Owns both pieces for the lifetime of the relay. The closures installed on
/// the ports only hold weak references, so dropping the coupling frees the
/// pieces (and with them their transports). Dropping an un-fired coupling
/// disconnects both sides.
pub struct Coupling<A: Piece, B: Piece> {
    a: Arc<Mutex<A>>,
    b: Arc<Mutex<B>>,
    guard: Arc<Guard>,
}

struct Guard {
    fired: AtomicBool,
    done: Notify,
}

/// Wires `a`'s outbound port into `b.accept_inbound` and vice versa.
///
/// Both disconnect observers share one guard: the first disconnect from
/// either side calls `accept_disconnect` on the other side and then on the
/// originator. Any later trigger is ignored.
///
/// Neither piece may be locked by the caller.
pub fn couple<A: Piece, B: Piece>(a: Arc<Mutex<A>>, b: Arc<Mutex<B>>) -> Coupling<A, B> {
    let (port_a, backlog_a) = {
        let a = a.lock();
        (a.port().clone(), a.inbound_backlog())
    };
    let (port_b, backlog_b) = {
        let b = b.lock();
        (b.port().clone(), b.inbound_backlog())
    };

    let guard = Arc::new(Guard {
        fired: AtomicBool::new(false),
        done: Notify::new(),
    });

    // Observers go in before the sinks so a transport that fails as soon as
    // it is wired still reaches the other side.
    port_a.set_disconnect_observer(guard.observer(Arc::downgrade(&b), Arc::downgrade(&a)));
    port_b.set_disconnect_observer(guard.observer(Arc::downgrade(&a), Arc::downgrade(&b)));
    port_a.set_outbound_sink(deliver_to(&b, backlog_b));
    port_b.set_outbound_sink(deliver_to(&a, backlog_a));

    Coupling { a, b, guard }
}

fn deliver_to<P: Piece>(piece: &Arc<Mutex<P>>, backlog: Option<Backlog>) -> Sink {
    let target = Arc::downgrade(piece);
    let sink = Sink::new(move |data| {
        if let Some(target) = target.upgrade() {
            target.lock().accept_inbound(data);
        }
    });
    match backlog {
        Some(backlog) => sink.with_backlog(backlog),
        None => sink,
    }
}

impl Guard {
    fn observer<O: Piece, S: Piece>(
        self: &Arc<Self>,
        other: Weak<Mutex<O>>,
        origin: Weak<Mutex<S>>,
    ) -> DisconnectObserver {
        let guard = self.clone();
        Box::new(move || {
            if guard.arm() {
                release(&other);
                release(&origin);
                guard.done.notify_waiters();
            }
        })
    }

    /// `true` for the first caller only.
    fn arm(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

fn release<P: Piece>(piece: &Weak<Mutex<P>>) {
    if let Some(piece) = piece.upgrade() {
        piece.lock().accept_disconnect();
    }
}

impl<A: Piece, B: Piece> Coupling<A, B> {
    pub fn is_closed(&self) -> bool {
        self.guard.fired.load(Ordering::Acquire)
    }

    /// Resolves once either side has disconnected.
    pub async fn closed(&self) {
        loop {
            let done = self.guard.done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if self.is_closed() {
                return;
            }
            done.await;
        }
    }
}

impl<A: Piece, B: Piece> Drop for Coupling<A, B> {
    fn drop(&mut self) {
        if self.guard.arm() {
            self.a.lock().accept_disconnect();
            self.b.lock().accept_disconnect();
            self.guard.done.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::piece::Port;

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

    fn probe() -> (Arc<Mutex<Probe>>, Port, Arc<Mutex<Vec<u8>>>, Arc<AtomicUsize>) {
        let probe = Probe::default();
        let port = probe.port.clone();
        let received = probe.received.clone();
        let disconnects = probe.disconnects.clone();
        (Arc::new(Mutex::new(probe)), port, received, disconnects)
    }

    #[test]
    fn bytes_cross_in_order() {
        let (a, port_a, recv_a, _) = probe();
        let (b, port_b, recv_b, _) = probe();
        let _coupling = couple(a, b);

        for chunk in [&b"GET / "[..], b"HTTP/1.1\r\n", b"\r\n"] {
            assert!(port_a.emit(Bytes::copy_from_slice(chunk)));
        }
        assert!(port_b.emit(Bytes::from_static(b"HTTP/1.1 200 OK")));

        assert_eq!(&recv_b.lock()[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(&recv_a.lock()[..], b"HTTP/1.1 200 OK");
    }

    #[test]
    fn disconnect_releases_both_sides_once() {
        let (a, port_a, _, down_a) = probe();
        let (b, port_b, _, down_b) = probe();
        let coupling = couple(a, b);

        port_a.disconnect();
        port_b.disconnect();
        port_a.disconnect();

        assert!(coupling.is_closed());
        assert_eq!(down_a.load(Ordering::SeqCst), 1);
        assert_eq!(down_b.load(Ordering::SeqCst), 1);
        assert!(!port_b.emit(Bytes::from_static(b"late")));
    }

    #[test]
    fn concurrent_disconnects_fire_once() {
        for _ in 0..200 {
            let (a, port_a, _, down_a) = probe();
            let (b, port_b, _, down_b) = probe();
            let _coupling = couple(a, b);

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [port_a, port_b]
                .into_iter()
                .map(|port| {
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        port.disconnect();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(down_a.load(Ordering::SeqCst), 1);
            assert_eq!(down_b.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn already_closed_piece_tears_down_peer_on_wiring() {
        let (a, port_a, _, _) = probe();
        let (b, _, _, down_b) = probe();
        port_a.disconnect();

        let coupling = couple(a, b);
        assert!(coupling.is_closed());
        assert_eq!(down_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_coupling_releases_pieces() {
        let (a, _, _, down_a) = probe();
        let (b, port_b, _, down_b) = probe();
        let weak_a = Arc::downgrade(&a);
        drop(couple(a, b));

        assert_eq!(down_a.load(Ordering::SeqCst), 1);
        assert_eq!(down_b.load(Ordering::SeqCst), 1);
        assert!(weak_a.upgrade().is_none());
        assert!(!port_b.disconnect());
    }

    #[tokio::test]
    async fn closed_resolves_after_disconnect() {
        let (a, port_a, _, _) = probe();
        let (b, _, _, _) = probe();
        let coupling = Arc::new(couple(a, b));

        let waiter = {
            let coupling = coupling.clone();
            tokio::spawn(async move { coupling.closed().await })
        };
        tokio::task::yield_now().await;
        port_a.disconnect();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
