//! Trait abstraction for the UDP bind.
//!
//! A [`Bind`] is the socket pair (conceptually one v4 and one v6 listener)
//! carrying tunnel datagrams. The device replaces its bind wholesale on
//! port or mark changes, which is why creation goes through a
//! [`BindFactory`] rather than a constructor.

pub mod channel;

use std::io;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::packet::{BufPool, PacketBuf};

/// IP version of a received datagram; the device runs one receiver per
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// An open UDP bind.
pub trait Bind: Send + Sync + 'static {
    /// Receive one datagram of the given IP version.
    ///
    /// Each version has exactly one caller at a time (the device's two
    /// receivers). Returns an error once the bind is closed.
    fn recv_from(
        &self,
        pool: &BufPool,
        version: IpVersion,
    ) -> impl Future<Output = io::Result<(PacketBuf, SocketAddr)>> + Send;

    /// Send one datagram.
    fn send_to(&self, packet: &[u8], dst: SocketAddr) -> impl Future<Output = io::Result<()>> + Send;

    /// The local port the bind listens on.
    fn local_port(&self) -> u16;

    /// Apply a firewall mark. Optional; the default succeeds silently.
    fn set_mark(&self, _mark: u32) -> io::Result<()> {
        Ok(())
    }

    /// Take the route-change event stream, if the platform exposes one.
    fn take_route_changes(&self) -> Option<mpsc::Receiver<()>> {
        None
    }

    /// Close the bind. Pending and future receives fail.
    fn close(&self);
}

/// Creates [`Bind`]s on demand.
///
/// `open(port)` may return a different port than requested (`port == 0`
/// requests an ephemeral one); the returned port becomes the device's
/// listen port.
pub trait BindFactory: Send + Sync + 'static {
    type Bind: Bind;

    fn open(&self, port: u16) -> impl Future<Output = io::Result<(Self::Bind, u16)>> + Send;
}

/// A peer's address on the wire.
///
/// The configured address list is immutable; roaming (learning a fresh
/// source address from an authenticated packet) only moves the active
/// destination. The cached source address is cleared when routes change so
/// the OS can re-choose an egress.
pub trait Endpoint: Send + Sync + std::fmt::Debug + 'static {
    /// The destination datagrams are currently sent to.
    fn dst(&self) -> SocketAddr;

    /// The configured addresses as a canonical comma-separated list.
    fn addrs(&self) -> String;

    /// Update the active destination after an authenticated packet arrived
    /// from `addr`.
    fn set_dst(&mut self, addr: SocketAddr);

    /// Forget the cached source address.
    fn clear_src(&mut self);
}

/// The default [`Endpoint`]: a parsed `host:port` list.
#[derive(Debug, Clone)]
pub struct StringEndpoint {
    addrs: Vec<SocketAddr>,
    active: SocketAddr,
    src: Option<std::net::IpAddr>,
}

impl StringEndpoint {
    /// Parse a comma-separated list of socket addresses. The first entry
    /// becomes the active destination.
    pub fn parse(s: &str) -> io::Result<Self> {
        let addrs = s
            .split(',')
            .map(|part| part.trim().parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let Some(active) = addrs.first().copied() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty endpoint"));
        };
        Ok(StringEndpoint {
            addrs,
            active,
            src: None,
        })
    }

    /// An endpoint learned from a single source address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        StringEndpoint {
            addrs: vec![addr],
            active: addr,
            src: None,
        }
    }

    /// The cached source address, if any.
    pub fn src(&self) -> Option<std::net::IpAddr> {
        self.src
    }
}

impl Endpoint for StringEndpoint {
    fn dst(&self) -> SocketAddr {
        self.active
    }

    fn addrs(&self) -> String {
        let strings: Vec<String> = self.addrs.iter().map(|a| a.to_string()).collect();
        strings.join(",")
    }

    fn set_dst(&mut self, addr: SocketAddr) {
        self.active = addr;
    }

    fn clear_src(&mut self) {
        self.src = None;
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;

    #[test]
    fn parse_single() {
        let ep = StringEndpoint::parse("192.0.2.1:51820").unwrap();
        assert_eq!(ep.dst(), "192.0.2.1:51820".parse().unwrap());
        assert_eq!(ep.addrs(), "192.0.2.1:51820");
    }

    #[test]
    fn parse_list_keeps_order_and_roams() {
        let mut ep = StringEndpoint::parse("192.0.2.1:1, 192.0.2.2:2").unwrap();
        assert_eq!(ep.addrs(), "192.0.2.1:1,192.0.2.2:2");
        assert_eq!(ep.dst(), "192.0.2.1:1".parse().unwrap());

        ep.set_dst("198.51.100.9:7".parse().unwrap());
        assert_eq!(ep.dst(), "198.51.100.9:7".parse().unwrap());
        // Roaming does not rewrite the configured list.
        assert_eq!(ep.addrs(), "192.0.2.1:1,192.0.2.2:2");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(StringEndpoint::parse("").is_err());
        assert!(StringEndpoint::parse("not-an-addr").is_err());
        assert!(StringEndpoint::parse("192.0.2.1:1,nope").is_err());
    }
}
