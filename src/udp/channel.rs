//! An in-process [`Bind`] backed by tokio channels.
//!
//! A [`ChannelNetwork`] is a tiny loopback fabric: every bind opened through
//! its factory registers a port, and `send_to` routes datagrams between
//! them. Binding an occupied port fails with `AddrInUse`, which makes the
//! port-conflict paths of the device testable without touching real
//! sockets.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{Bind, BindFactory, IpVersion};
use crate::packet::{BufPool, PacketBuf};

type Datagram = (Vec<u8>, SocketAddr);

const INBOX_DEPTH: usize = 256;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// An in-memory loopback fabric connecting [`ChannelBind`]s.
#[derive(Clone, Default, Debug)]
pub struct ChannelNetwork {
    inner: Arc<parking_lot::Mutex<NetworkInner>>,
}

#[derive(Default, Debug)]
struct NetworkInner {
    ports: HashMap<u16, Inbox>,
    route_watchers: Vec<mpsc::Sender<()>>,
    next_ephemeral: u16,
}

#[derive(Debug)]
struct Inbox {
    v4: mpsc::Sender<Datagram>,
    v6: mpsc::Sender<Datagram>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory opening binds on this network.
    pub fn factory(&self) -> ChannelBindFactory {
        ChannelBindFactory {
            network: self.clone(),
        }
    }

    /// Notify every bind's route listener, as a platform route table change
    /// would.
    pub fn trigger_route_change(&self) {
        let watchers = self.inner.lock().route_watchers.clone();
        for watcher in watchers {
            let _ = watcher.try_send(());
        }
    }

    /// Whether `port` is currently bound.
    pub fn port_in_use(&self, port: u16) -> bool {
        self.inner.lock().ports.contains_key(&port)
    }

    fn register(&self, port: u16) -> io::Result<(u16, RegisteredBind)> {
        let mut inner = self.inner.lock();

        let port = if port != 0 {
            if inner.ports.contains_key(&port) {
                return Err(io::ErrorKind::AddrInUse.into());
            }
            port
        } else {
            loop {
                let candidate = FIRST_EPHEMERAL_PORT.wrapping_add(inner.next_ephemeral);
                inner.next_ephemeral = inner.next_ephemeral.wrapping_add(1);
                if candidate >= FIRST_EPHEMERAL_PORT && !inner.ports.contains_key(&candidate) {
                    break candidate;
                }
            }
        };

        let (v4_tx, v4_rx) = mpsc::channel(INBOX_DEPTH);
        let (v6_tx, v6_rx) = mpsc::channel(INBOX_DEPTH);
        let (route_tx, route_rx) = mpsc::channel(4);
        inner.ports.insert(port, Inbox { v4: v4_tx, v6: v6_tx });
        inner.route_watchers.push(route_tx);

        Ok((
            port,
            RegisteredBind {
                v4_rx,
                v6_rx,
                route_rx,
            },
        ))
    }

    fn deregister(&self, port: u16) {
        self.inner.lock().ports.remove(&port);
    }

    fn inbox(&self, port: u16) -> Option<Inbox> {
        let inner = self.inner.lock();
        inner.ports.get(&port).map(|inbox| Inbox {
            v4: inbox.v4.clone(),
            v6: inbox.v6.clone(),
        })
    }
}

struct RegisteredBind {
    v4_rx: mpsc::Receiver<Datagram>,
    v6_rx: mpsc::Receiver<Datagram>,
    route_rx: mpsc::Receiver<()>,
}

/// Opens [`ChannelBind`]s on a [`ChannelNetwork`].
#[derive(Clone)]
pub struct ChannelBindFactory {
    network: ChannelNetwork,
}

impl BindFactory for ChannelBindFactory {
    type Bind = ChannelBind;

    async fn open(&self, port: u16) -> io::Result<(ChannelBind, u16)> {
        let (port, registered) = self.network.register(port)?;
        let bind = ChannelBind {
            network: self.network.clone(),
            port,
            v4_rx: AsyncMutex::new(registered.v4_rx),
            v6_rx: AsyncMutex::new(registered.v6_rx),
            route_rx: parking_lot::Mutex::new(Some(registered.route_rx)),
            closed: AtomicBool::new(false),
        };
        Ok((bind, port))
    }
}

/// One registered port on a [`ChannelNetwork`].
#[derive(Debug)]
pub struct ChannelBind {
    network: ChannelNetwork,
    port: u16,
    v4_rx: AsyncMutex<mpsc::Receiver<Datagram>>,
    v6_rx: AsyncMutex<mpsc::Receiver<Datagram>>,
    route_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
}

impl Bind for ChannelBind {
    async fn recv_from(
        &self,
        pool: &BufPool,
        version: IpVersion,
    ) -> io::Result<(PacketBuf, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let rx = match version {
            IpVersion::V4 => &self.v4_rx,
            IpVersion::V6 => &self.v6_rx,
        };
        let (data, src) = rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut buf = pool.get();
        buf.extend_from_slice(&data);
        Ok((buf, src))
    }

    async fn send_to(&self, packet: &[u8], dst: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let Some(inbox) = self.network.inbox(dst.port()) else {
            // Nothing is listening; a real network would drop it too.
            return Ok(());
        };
        let (slot, src): (_, SocketAddr) = match dst.ip() {
            IpAddr::V4(_) => (inbox.v4, (Ipv4Addr::LOCALHOST, self.port).into()),
            IpAddr::V6(_) => (inbox.v6, (Ipv6Addr::LOCALHOST, self.port).into()),
        };
        // A full inbox is packet loss, not an error.
        let _ = slot.try_send((packet.to_vec(), src));
        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn take_route_changes(&self) -> Option<mpsc::Receiver<()>> {
        self.route_rx.lock().take()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.deregister(self.port);
        }
    }
}

impl Drop for ChannelBind {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_route_between_binds() {
        let network = ChannelNetwork::new();
        let factory = network.factory();
        let pool = BufPool::new(8, 2048);

        let (a, port_a) = factory.open(0).await.unwrap();
        let (b, port_b) = factory.open(0).await.unwrap();
        assert_ne!(port_a, port_b);

        a.send_to(b"ping", (Ipv4Addr::LOCALHOST, port_b).into())
            .await
            .unwrap();
        let (packet, src) = b.recv_from(&pool, IpVersion::V4).await.unwrap();
        assert_eq!(&*packet, b"ping");
        assert_eq!(src, SocketAddr::from((Ipv4Addr::LOCALHOST, port_a)));
    }

    #[tokio::test]
    async fn occupied_port_is_rejected() {
        let network = ChannelNetwork::new();
        let factory = network.factory();

        let (_a, port) = factory.open(51900).await.unwrap();
        assert_eq!(port, 51900);
        let err = factory.open(51900).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn close_frees_the_port_and_fails_receives() {
        let network = ChannelNetwork::new();
        let factory = network.factory();
        let pool = BufPool::new(8, 2048);

        let (a, port) = factory.open(51901).await.unwrap();
        a.close();
        assert!(a.recv_from(&pool, IpVersion::V4).await.is_err());
        assert!(!network.port_in_use(port));

        let (_b, port_again) = factory.open(51901).await.unwrap();
        assert_eq!(port_again, 51901);
    }
}
