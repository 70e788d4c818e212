//! RFC 1928 CONNECT reply serialization.
//!
//! Grounded in `original_source/src/socks5/request.c` (`request_marshal_reply`)
//! and §4.4/Design Notes of the design: the only place a port crosses back
//! into network byte order is here, at serialization — everywhere else in
//! the codebase a port is a host-order `u16`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::request::VERSION;

/// REP status codes, per RFC 1928 section 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Status::Succeeded => 0x00,
            Status::GeneralFailure => 0x01,
            Status::ConnectionNotAllowed => 0x02,
            Status::NetworkUnreachable => 0x03,
            Status::HostUnreachable => 0x04,
            Status::ConnectionRefused => 0x05,
            Status::TtlExpired => 0x06,
            Status::CommandNotSupported => 0x07,
            Status::AddressTypeNotSupported => 0x08,
        }
    }

    /// Map a connect `io::Error`'s kind to the closest RFC 1928 status.
    pub fn from_connect_error(err: &std::io::Error) -> Status {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused => Status::ConnectionRefused,
            TimedOut => Status::TtlExpired,
            _ => Status::HostUnreachable,
        }
    }
}

const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

/// Serialize a full CONNECT reply: VER, REP, RSV, ATYP, BND.ADDR, BND.PORT.
/// `bound` is the local address of the socket used to reach the origin
/// server; on failure (before a socket exists) callers pass `None` and the
/// unspecified address is used, matching the source's behaviour of echoing
/// back `0.0.0.0:0` on early failures.
pub fn serialize(status: Status, bound: Option<SocketAddr>) -> Vec<u8> {
    let addr = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut out = Vec::with_capacity(22);
    out.push(VERSION);
    out.push(status.code());
    out.push(0x00); // RSV

    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Convenience for the common case of an IPv4 bound address.
pub fn serialize_ipv4(status: Status, ip: Ipv4Addr, port: u16) -> Vec<u8> {
    serialize(status, Some(SocketAddr::new(IpAddr::V4(ip), port)))
}

/// Reply for the case no connection attempt was ever made (no bound socket).
pub fn serialize_failure(status: Status) -> Vec<u8> {
    serialize(status, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_success_ipv4() {
        let bytes = serialize_ipv4(Status::Succeeded, Ipv4Addr::new(10, 0, 0, 1), 54321);
        assert_eq!(bytes[0], VERSION);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[2], 0x00);
        assert_eq!(bytes[3], ATYP_IPV4);
        assert_eq!(&bytes[4..8], &[10, 0, 0, 1]);
        assert_eq!(&bytes[8..10], &54321u16.to_be_bytes());
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn test_serialize_failure_uses_unspecified_address() {
        let bytes = serialize_failure(Status::HostUnreachable);
        assert_eq!(bytes[1], 0x04);
        assert_eq!(bytes[3], ATYP_IPV4);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..10], &[0, 0]);
    }

    #[test]
    fn test_serialize_ipv6_bound_address() {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000);
        let bytes = serialize(Status::Succeeded, Some(addr));
        assert_eq!(bytes[3], ATYP_IPV6);
        assert_eq!(bytes.len(), 4 + 16 + 2);
        assert_eq!(&bytes[bytes.len() - 2..], &9000u16.to_be_bytes());
    }

    #[test]
    fn test_from_connect_error_maps_refused() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Status::from_connect_error(&err), Status::ConnectionRefused);
    }

    #[test]
    fn test_from_connect_error_defaults_to_host_unreachable() {
        let err = std::io::Error::from(std::io::ErrorKind::Other);
        assert_eq!(Status::from_connect_error(&err), Status::HostUnreachable);
    }
}
