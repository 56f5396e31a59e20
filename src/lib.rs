pub mod config;
pub mod control;
pub mod forward;
pub mod piece;
pub mod socks;

pub use config::Config;
pub use control::{AllowAll, Control, Lifecycle};
pub use forward::{ConnectError, Connector, DirectConnector, ForwardingSocket};
pub use piece::{couple, Coupling, Piece, Port, Sink};
pub use socks::{Destination, Reply, Server, SessionState, SocksSession};
