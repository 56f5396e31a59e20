//! SOCKS5 frames (RFC 1928), CONNECT and no-auth only.
//!
//! Parsers work on a prefix of the pending buffer and return `Ok(None)` until
//! a complete frame is present, so the caller can feed arbitrary fragments.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use compact_str::CompactString;
use thiserror::Error;

use super::{ADDR_DOMAIN, ADDR_IPV4, ADDR_IPV6, COMMAND_CONNECT, SOCKS5};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Domain(CompactString, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(addr) => addr.port(),
            Self::V6(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr) => fmt::Display::fmt(addr, f),
            Self::V6(addr) => fmt::Display::fmt(addr, f),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0}")]
    BadVersion(u8),
    #[error("no acceptable auth methods")]
    NoAcceptableMethod,
    #[error("reserved byte is not zero: {0}")]
    BadReserved(u8),
    #[error("command not supported: {0}")]
    UnsupportedCommand(u8),
    #[error("unknown address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("invalid domain name")]
    InvalidDomain,
    #[error("too many bytes buffered before relaying")]
    Overflow,
}

impl ProtocolError {
    /// Reply owed to the client once a version has been agreed on.
    pub fn reply(&self) -> Reply {
        match self {
            Self::UnsupportedCommand(_) => Reply::CommandNotSupported,
            Self::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// `VER NMETHODS`. Yields the method count.
pub fn greeting_header(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match buf {
        [] => Ok(None),
        [version, ..] if *version != SOCKS5 => Err(ProtocolError::BadVersion(*version)),
        [_] => Ok(None),
        [_, n_methods, ..] => Ok(Some(*n_methods as usize)),
    }
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`. Yields the destination and the number
/// of bytes the frame occupies.
///
/// Fields are checked as soon as they arrive, so an unsupported command is
/// reported before the address is complete.
pub fn request(buf: &[u8]) -> Result<Option<(Destination, usize)>, ProtocolError> {
    let field = |i: usize| buf.get(i).copied();

    let Some(version) = field(0) else { return Ok(None) };
    if version != SOCKS5 {
        return Err(ProtocolError::BadVersion(version));
    }
    let Some(command) = field(1) else { return Ok(None) };
    if command != COMMAND_CONNECT {
        return Err(ProtocolError::UnsupportedCommand(command));
    }
    let Some(reserved) = field(2) else { return Ok(None) };
    if reserved != 0 {
        return Err(ProtocolError::BadReserved(reserved));
    }
    let Some(address_type) = field(3) else { return Ok(None) };

    let (addr_start, addr_len) = match address_type {
        ADDR_IPV4 => (4, 4),
        ADDR_IPV6 => (4, 16),
        ADDR_DOMAIN => match field(4) {
            None => return Ok(None),
            Some(0) => return Err(ProtocolError::InvalidDomain),
            Some(len) => (5, len as usize),
        },
        other => return Err(ProtocolError::UnsupportedAddressType(other)),
    };
    let port_at = addr_start + addr_len;
    let frame_len = port_at + 2;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let addr = &buf[addr_start..port_at];
    let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);
    let destination = match address_type {
        ADDR_IPV4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(addr);
            Destination::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
        }
        ADDR_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            Destination::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
        _ => Destination::Domain(CompactString::from_utf8_lossy(addr), port),
    };
    Ok(Some((destination, frame_len)))
}

pub fn method_selection(method: u8) -> [u8; 2] {
    [SOCKS5, method]
}

/// Request reply with `BND.ADDR` 0.0.0.0 and `BND.PORT` 0.
pub fn reply(status: Reply) -> [u8; 10] {
    #[rustfmt::skip]
    let frame = [
        SOCKS5,                 // version
        status.code(),          // status
        0x00,                   // reserved
        ADDR_IPV4,              // address type
        0x00, 0x00, 0x00, 0x00, // IPv4 address
        0x00, 0x00,             // port
    ];
    frame
}
