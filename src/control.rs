//! Hooks for an external policy/UI layer.

use async_trait::async_trait;

use crate::socks::{CloseReason, ConnId, Destination};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Resolved(Destination),
    Established(Destination),
    Closed(CloseReason),
}

/// Decides whether a destination may be reached and hears about
/// connection lifecycle changes. The core never decides policy itself.
#[async_trait]
pub trait Control: Send + Sync + 'static {
    async fn authorize(&self, _id: ConnId, _destination: &Destination) -> bool {
        true
    }

    fn notify(&self, _id: ConnId, _event: Lifecycle) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Control for AllowAll {}
