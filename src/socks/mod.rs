mod codec;
mod server;
mod session;

pub use codec::{Destination, ProtocolError, Reply};
pub use server::{ConnId, ConnectionInfo, Registry, Server};
pub use session::{drive, CloseReason, SessionEvent, SessionState, SocksSession};

const SOCKS5: u8 = 5;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const COMMAND_CONNECT: u8 = 0x01;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
