//! The device core: lifecycle, peer set, identity and the pipeline.
//!
//! A [`Device`] owns a TUN interface, a UDP bind and a set of peers, and
//! runs the worker pipeline that encrypts TUN reads onto the wire and
//! decrypts datagrams back into the TUN. Mutating operations follow a
//! strict lock order:
//!
//! `state` → `net` → `static identity` → `peer map` → per-peer →
//! per-peer handshake → per-peer keypairs
//!
//! A lock may be taken on its own at any level; while one is held, only
//! locks further down the order may be acquired.

pub(crate) mod allowed_ips;
pub mod configure;
mod net;
mod peer;
mod pipeline;
mod queue;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::noise::handshake::Handshake;
use crate::noise::{CookieChecker, IndexTable, Keypair, RateLimiter};
use crate::packet::BufPool;
use crate::tun::TunDevice;
use crate::udp::{Bind, BindFactory, Endpoint, StringEndpoint};

use allowed_ips::AllowedIps;
use net::NetState;
use queue::PipelineQueues;

pub use configure::{Config, PeerConfig};
pub use peer::Peer;

/// Depth of the global outbound encryption queue.
pub(crate) const QUEUE_OUTBOUND_SIZE: usize = 1024;
/// Depth of the global inbound decryption queue.
pub(crate) const QUEUE_INBOUND_SIZE: usize = 1024;
/// Depth of the global handshake queue.
pub(crate) const QUEUE_HANDSHAKE_SIZE: usize = 1024;
/// Depth of the per-peer staged-plaintext queue.
pub(crate) const QUEUE_STAGED_SIZE: usize = 128;

/// Handshake queue depth at which the device considers itself under load.
const UNDER_LOAD_QUEUE_SIZE: usize = QUEUE_HANDSHAKE_SIZE / 8;
/// How long the under-load state lingers after the queue drains.
const UNDER_LOAD_AFTER: Duration = Duration::from_secs(1);
/// Handshakes per source IP per second tolerated before dropping.
const HANDSHAKE_RATE_LIMIT: u64 = 100;

/// Size of each pooled message buffer; bounds the largest datagram.
pub(crate) const MAX_MESSAGE_SIZE: usize = 4096;
/// Number of pre-allocated message buffers.
const POOL_CAPACITY: usize = 1024;

const DEFAULT_MTU: u16 = 1420;

/// Error of [`Device`]-related operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device is closed")]
    Closed,

    #[error("unable to update bind: {0}")]
    Bind(#[source] io::Error),

    #[error("local port in use")]
    PortInUse,

    #[error("invalid endpoint: {0}")]
    Endpoint(#[source] io::Error),

    #[error("peer public key matches device public key")]
    SelfPeer,

    #[error("peer already exists")]
    PeerExists,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The transports a [`Device`] is built over: a bind factory and a TUN
/// device. Implemented for `(F, Tun)` tuples.
pub trait DeviceTransports: Send + Sync + 'static {
    type BindFactory: BindFactory<Bind = Self::Bind>;
    type Bind: Bind;
    type Tun: TunDevice;
}

impl<F, Tun> DeviceTransports for (F, Tun)
where
    F: BindFactory,
    Tun: TunDevice,
{
    type BindFactory = F;
    type Bind = F::Bind;
    type Tun = Tun;
}

type CreateEndpointFn =
    Box<dyn Fn(&PublicKey, &str) -> io::Result<Box<dyn Endpoint>> + Send + Sync>;
type HandshakeDoneFn = Box<dyn Fn(&PublicKey, &[IpNetwork]) + Send + Sync>;
type UnexpectedIpFn = Box<dyn Fn(&PublicKey, IpAddr) + Send + Sync>;

/// Callbacks and knobs consumed at construction.
pub struct DeviceOptions {
    /// Build a peer endpoint from its configured address string. The
    /// default parses a comma-separated `host:port` list.
    pub create_endpoint: CreateEndpointFn,
    /// Invoked whenever a handshake completes with a peer.
    pub handshake_done: Option<HandshakeDoneFn>,
    /// Invoked when a decrypted packet's inner source address is not
    /// routed to the decrypting peer. The packet is dropped either way.
    pub unexpected_ip: Option<UnexpectedIpFn>,
    /// When set, an existing bind is never replaced by
    /// [`bind updates`](DeviceInner::bind_update).
    pub skip_bind_update: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            create_endpoint: Box::new(|_, addrs| {
                StringEndpoint::parse(addrs).map(|ep| Box::new(ep) as Box<dyn Endpoint>)
            }),
            handshake_done: None,
            unexpected_ip: None,
            skip_bind_update: false,
        }
    }
}

/// A handle to a device. Cheap to clone; the device lives until
/// [`close`](Device::close).
pub struct Device<T: DeviceTransports> {
    inner: Arc<DeviceInner<T>>,
}

impl<T: DeviceTransports> Clone for Device<T> {
    fn clone(&self) -> Self {
        Device {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A session resolvable from a receiver index: either an in-progress
/// initiator handshake or an installed keypair.
pub(crate) enum Session<T: DeviceTransports> {
    Handshake(Weak<Peer<T>>),
    Keypair {
        peer: Weak<Peer<T>>,
        keypair: Weak<Keypair>,
    },
}

impl<T: DeviceTransports> Clone for Session<T> {
    fn clone(&self) -> Self {
        match self {
            Session::Handshake(peer) => Session::Handshake(Weak::clone(peer)),
            Session::Keypair { peer, keypair } => Session::Keypair {
                peer: Weak::clone(peer),
                keypair: Weak::clone(keypair),
            },
        }
    }
}

struct StateMachine {
    /// Guards against concurrent state transitions; swapped on entry.
    changing: AtomicBool,
    lock: AsyncMutex<StateInner>,
}

struct StateInner {
    /// The state the device has actually reached.
    current: bool,
    /// The global worker fleet, awaited at close.
    workers: JoinSet<()>,
}

pub(crate) struct StaticIdentity {
    /// `None` is the zero key: the device cannot handshake.
    pub key_pair: Option<(StaticSecret, PublicKey)>,
}

impl StaticIdentity {
    fn public_key(&self) -> Option<PublicKey> {
        self.key_pair.as_ref().map(|kp| kp.1)
    }
}

struct PeerMap<T: DeviceTransports> {
    map: HashMap<PublicKey, Arc<Peer<T>>>,
}

pub(crate) struct DeviceInner<T: DeviceTransports> {
    is_up: AtomicBool,
    is_closed: AtomicBool,

    state: StateMachine,
    pub(crate) net: AsyncRwLock<NetState<T>>,
    pub(crate) static_identity: AsyncRwLock<StaticIdentity>,
    peers: AsyncRwLock<PeerMap<T>>,
    peers_empty: AtomicBool,

    pub(crate) allowed_ips: parking_lot::RwLock<AllowedIps<Arc<Peer<T>>>>,
    pub(crate) sessions: IndexTable<Session<T>>,
    pub(crate) cookie_checker: CookieChecker,
    pub(crate) rate_limiter: RateLimiter,
    /// Nanoseconds after `created` until which the device counts as under
    /// load.
    under_load_until: AtomicU64,
    created: Instant,

    pub(crate) pool: BufPool,
    pub(crate) queues: PipelineQueues,
    pub(crate) stop: CancellationToken,

    pub(crate) tun: T::Tun,
    tun_mtu: AtomicU32,
    pub(crate) bind_factory: T::BindFactory,
    pub(crate) callbacks: DeviceOptions,
}

impl<T: DeviceTransports> Device<T> {
    /// Construct a device and spawn its worker fleet.
    ///
    /// Must be called within a tokio runtime. The device starts `Down` with
    /// no private key and no peers.
    pub fn new(tun: T::Tun, bind_factory: T::BindFactory, options: DeviceOptions) -> Self {
        let mtu = match tun.mtu() {
            Ok(mtu) => mtu,
            Err(err) => {
                log::error!("trouble determining MTU, assuming default: {err}");
                DEFAULT_MTU
            }
        };
        let tun_events = tun.take_events();

        let inner = Arc::new(DeviceInner {
            is_up: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            state: StateMachine {
                changing: AtomicBool::new(false),
                lock: AsyncMutex::new(StateInner {
                    current: false,
                    workers: JoinSet::new(),
                }),
            },
            net: AsyncRwLock::new(NetState::new(0)),
            static_identity: AsyncRwLock::new(StaticIdentity { key_pair: None }),
            peers: AsyncRwLock::new(PeerMap {
                map: HashMap::new(),
            }),
            peers_empty: AtomicBool::new(true),
            allowed_ips: parking_lot::RwLock::new(AllowedIps::new()),
            sessions: IndexTable::new(),
            cookie_checker: CookieChecker::new(),
            rate_limiter: RateLimiter::new(HANDSHAKE_RATE_LIMIT),
            under_load_until: AtomicU64::new(0),
            created: Instant::now(),
            pool: BufPool::new(POOL_CAPACITY, MAX_MESSAGE_SIZE),
            queues: PipelineQueues::new(),
            stop: CancellationToken::new(),
            tun,
            tun_mtu: AtomicU32::new(u32::from(mtu)),
            bind_factory,
            callbacks: options,
        });

        // Start the worker fleet. The state lock is free on a fresh device.
        let mut state = inner
            .state
            .lock
            .try_lock()
            .expect("state lock is free at construction");
        let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
        for _ in 0..cpus {
            state.workers.spawn(pipeline::routine_encryption(
                inner.queues.encryption.receiver(),
                inner.pool.clone(),
            ));
            state.workers.spawn(pipeline::routine_decryption(
                Arc::clone(&inner.queues.decryption_rx),
                inner.pool.clone(),
                inner.stop.child_token(),
            ));
            state.workers.spawn(pipeline::routine_handshake(
                Arc::downgrade(&inner),
                Arc::clone(&inner.queues.handshake_rx),
                inner.stop.child_token(),
            ));
        }
        state.workers.spawn(pipeline::routine_read_from_tun(
            Arc::downgrade(&inner),
            inner.stop.child_token(),
        ));
        if let Some(events) = tun_events {
            state.workers.spawn(pipeline::routine_tun_events(
                Arc::downgrade(&inner),
                events,
                inner.stop.child_token(),
            ));
        }
        drop(state);

        log::info!("device created ({cpus} workers per pool)");
        Device { inner }
    }

    /// Bring the device up. Fails on a closed device; on bind failure the
    /// device reverts to `Down`.
    pub async fn up(&self) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.request_state(true).await
    }

    /// Bring the device down, closing the bind and stopping every peer.
    pub async fn down(&self) -> Result<(), Error> {
        self.inner.request_state(false).await
    }

    pub fn is_up(&self) -> bool {
        self.inner.is_up()
    }

    /// Resolves once the device has been closed.
    pub async fn wait(&self) {
        self.inner.stop.cancelled().await;
    }

    /// The current MTU of the tunnel interface.
    pub fn mtu(&self) -> u16 {
        self.inner.tun_mtu.load(Ordering::Relaxed) as u16
    }

    /// The port the bind listens on (0 when unbound and no port was
    /// requested).
    pub async fn listen_port(&self) -> u16 {
        self.inner.net.read().await.port
    }

    /// Whether a bind is currently open.
    pub async fn has_bind(&self) -> bool {
        self.inner.bind().await.is_some()
    }

    /// Change the firewall mark on the bind.
    pub async fn set_fwmark(&self, mark: u32) -> Result<(), Error> {
        self.inner.bind_set_mark(mark).await
    }

    /// Replace the device's static identity. `None` is the zero key.
    ///
    /// Removes any peer whose public key matches the new identity, expires
    /// every remaining peer's keypairs and recomputes their static-static
    /// secrets.
    pub async fn set_private_key(&self, private_key: Option<StaticSecret>) -> Result<(), Error> {
        self.inner.set_private_key(private_key).await
    }

    /// The device's public key, if a private key is set.
    pub async fn public_key(&self) -> Option<PublicKey> {
        self.inner.static_identity.read().await.public_key()
    }

    pub async fn lookup_peer(&self, public_key: &PublicKey) -> Option<Arc<Peer<T>>> {
        self.inner.lookup_peer(public_key).await
    }

    /// Stop a peer and remove it from the map and routing table.
    pub async fn remove_peer(&self, public_key: &PublicKey) {
        self.inner.remove_peer(public_key).await;
    }

    /// Remove every peer. See [`remove_peer`](Self::remove_peer).
    pub async fn remove_all_peers(&self) {
        self.inner.remove_all_peers().await;
    }

    /// Queue a keepalive on every peer holding a live keypair.
    pub async fn send_keepalives_to_peers_with_current_keypair(&self) {
        self.inner.send_keepalives_to_peers_with_current_keypair().await;
    }

    /// Whether the handshake queue is deep enough (or was recently) for the
    /// handshake path to demand cookies.
    pub fn is_under_load(&self) -> bool {
        self.inner.is_under_load()
    }

    /// Close the device: tear down the bind and TUN, stop the pipeline,
    /// remove all peers and drain every queue. Idempotent; the only valid
    /// operation afterwards is `close` itself.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("device closing");

        // Block state transitions for good.
        inner.state.changing.store(true, Ordering::Release);
        let mut state = inner.state.lock.lock().await;

        inner.tun.close();
        inner.bind_close().await;
        inner.is_up.store(false, Ordering::Release);

        // Release our reference on the encryption queue; peers started
        // after this point cannot subscribe, so the channel is guaranteed
        // to close once running producers wind down.
        inner.queues.encryption.release();
        inner.stop.cancel();

        while state.workers.join_next().await.is_some() {}
        state.current = false;
        drop(state);

        inner.remove_all_peers().await;
        inner.flush_packet_queues().await;
        inner.rate_limiter.close();

        inner.state.changing.store(false, Ordering::Release);
        log::info!("interface closed");
    }

    pub(crate) fn inner(&self) -> &Arc<DeviceInner<T>> {
        &self.inner
    }
}

impl<T: DeviceTransports> DeviceInner<T> {
    pub(crate) fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.tun_mtu.store(u32::from(mtu), Ordering::Relaxed);
    }

    /// Record the desired up/down state and drive the state machine toward
    /// it.
    pub(crate) async fn request_state(self: &Arc<Self>, up: bool) -> Result<(), Error> {
        self.is_up.store(up, Ordering::Release);
        self.update_state().await
    }

    /// Apply the desired state, then re-examine it: a transition requested
    /// while another was in flight is applied by whichever caller holds the
    /// `changing` guard. The final state equals the last request to
    /// complete.
    async fn update_state(self: &Arc<Self>) -> Result<(), Error> {
        loop {
            if self.state.changing.swap(true, Ordering::AcqRel) {
                // Another transition is in progress; it will observe our
                // requested state.
                return Ok(());
            }

            let mut state = self.state.lock.lock().await;
            let new_is_up = self.is_up();
            if new_is_up == state.current {
                drop(state);
                self.state.changing.store(false, Ordering::Release);
                return Ok(());
            }

            if new_is_up {
                if let Err(err) = self.bind_update().await {
                    self.is_up.store(false, Ordering::Release);
                    drop(state);
                    self.state.changing.store(false, Ordering::Release);
                    return Err(err);
                }
                let peers = self.peer_list().await;
                for peer in &peers {
                    peer.start().await;
                }
                for peer in &peers {
                    if peer.persistent_keepalive() > 0 {
                        peer.send_keepalive();
                    }
                }
            } else {
                self.bind_close().await;
                for peer in self.peer_list().await {
                    peer.stop().await;
                }
            }

            state.current = new_is_up;
            drop(state);
            self.state.changing.store(false, Ordering::Release);

            // Re-check: the desired state may have flipped while this
            // transition was applied.
        }
    }

    pub(crate) async fn lookup_peer(&self, public_key: &PublicKey) -> Option<Arc<Peer<T>>> {
        self.peers.read().await.map.get(public_key).cloned()
    }

    pub(crate) async fn peer_list(&self) -> Vec<Arc<Peer<T>>> {
        self.peers.read().await.map.values().cloned().collect()
    }

    pub(crate) async fn peer_count(&self) -> usize {
        self.peers.read().await.map.len()
    }

    pub(crate) fn peers_is_empty(&self) -> bool {
        self.peers_empty.load(Ordering::Acquire)
    }

    /// Create a peer and insert it into the map and, when up, start it.
    /// The caller inserts allowed-IP routes separately.
    pub(crate) async fn new_peer(
        self: &Arc<Self>,
        public_key: PublicKey,
    ) -> Result<Arc<Peer<T>>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let identity = self.static_identity.read().await;
        if identity.public_key() == Some(public_key) {
            return Err(Error::SelfPeer);
        }
        let private_key = identity.key_pair.as_ref().map(|kp| &kp.0);

        let mut peers = self.peers.write().await;
        if peers.map.contains_key(&public_key) {
            return Err(Error::PeerExists);
        }
        let peer = Peer::new(Arc::downgrade(self), public_key, private_key);
        peers.map.insert(public_key, Arc::clone(&peer));
        self.peers_empty.store(false, Ordering::Release);
        drop(peers);
        drop(identity);

        if self.is_up() {
            peer.start().await;
        }
        log::debug!("peer added");
        Ok(peer)
    }

    /// Remove `peer` from the map and routing table under the peer-map
    /// lock. Stopping happens outside.
    fn unsafe_remove_peer(
        &self,
        peers: &mut PeerMap<T>,
        public_key: &PublicKey,
    ) -> Option<Arc<Peer<T>>> {
        let peer = peers.map.remove(public_key)?;
        self.allowed_ips
            .write()
            .remove(|candidate| Arc::ptr_eq(candidate, &peer));
        self.peers_empty
            .store(peers.map.is_empty(), Ordering::Release);
        Some(peer)
    }

    pub(crate) async fn remove_peer(&self, public_key: &PublicKey) {
        let peer = {
            let mut peers = self.peers.write().await;
            self.unsafe_remove_peer(&mut peers, public_key)
        };
        if let Some(peer) = peer {
            peer.stop().await;
            log::debug!("peer removed");
        }
    }

    pub(crate) async fn remove_all_peers(&self) {
        let removed = {
            let mut peers = self.peers.write().await;
            // Replace wholesale rather than draining in place.
            let old = std::mem::take(&mut peers.map);
            self.allowed_ips.write().clear();
            self.peers_empty.store(true, Ordering::Release);
            old
        };
        for peer in removed.into_values() {
            peer.stop().await;
        }
    }

    /// Replace the static identity. See [`Device::set_private_key`].
    pub(crate) async fn set_private_key(
        self: &Arc<Self>,
        private_key: Option<StaticSecret>,
    ) -> Result<(), Error> {
        let mut peers_to_stop: Vec<Arc<Peer<T>>> = Vec::new();
        let mut peers_to_expire: Vec<Arc<Peer<T>>> = Vec::new();

        {
            let mut identity = self.static_identity.write().await;
            let new_public = private_key.as_ref().map(PublicKey::from);
            // x25519 (rightly) doesn't let us compare secret keys; equal
            // public keys imply equal private keys.
            if identity.public_key() == new_public {
                return Ok(());
            }

            let mut peers = self.peers.write().await;

            // Take every peer's handshake lock, in map-iteration order, and
            // hold them across the whole barrier: no handshake can complete
            // while the identity changes underneath it.
            let mut locked: Vec<(PublicKey, OwnedRwLockWriteGuard<Handshake>)> =
                Vec::with_capacity(peers.map.len());
            for (public_key, peer) in peers.map.iter() {
                locked.push((*public_key, Arc::clone(&peer.handshake).write_owned().await));
            }

            // Remove peers whose remote static matches the new identity.
            if let Some(new_public) = new_public {
                if let Some(peer) = self.unsafe_remove_peer(&mut peers, &new_public) {
                    peers_to_stop.push(peer);
                }
            }

            identity.key_pair =
                private_key.map(|sk| (sk.clone(), PublicKey::from(&sk)));
            if let Some(public_key) = identity.public_key() {
                self.cookie_checker.init(&public_key);
            }

            // Static-static DH precomputation for every remaining peer.
            for (public_key, handshake) in locked.iter_mut() {
                if !peers.map.contains_key(public_key) {
                    continue;
                }
                match &identity.key_pair {
                    Some((sk, _)) => handshake.precompute(sk),
                    None => handshake.precomputed_static_static = [0; 32],
                }
            }
            peers_to_expire.extend(peers.map.values().cloned());

            // Release the handshake locks in reverse order.
            while let Some((_, guard)) = locked.pop() {
                drop(guard);
            }
        }

        for peer in peers_to_expire {
            peer.expire_current_keypairs();
        }
        for peer in peers_to_stop {
            peer.stop().await;
        }
        Ok(())
    }

    /// Whether the handshake queue is (or was recently) deep enough to
    /// warrant cookie challenges.
    pub(crate) fn is_under_load(&self) -> bool {
        let now = self.created.elapsed().as_nanos() as u64;
        if self.queues.handshake_depth() >= UNDER_LOAD_QUEUE_SIZE {
            let until = now + UNDER_LOAD_AFTER.as_nanos() as u64;
            self.under_load_until.store(until, Ordering::Relaxed);
            return true;
        }
        now < self.under_load_until.load(Ordering::Relaxed)
    }

    /// Send raw bytes through the current bind.
    pub(crate) async fn send_raw(
        &self,
        packet: &[u8],
        dst: std::net::SocketAddr,
    ) -> io::Result<()> {
        let bind = self.bind().await;
        let Some(bind) = bind else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        bind.send_to(packet, dst).await
    }

    pub(crate) async fn send_keepalives_to_peers_with_current_keypair(&self) {
        if self.is_closed() {
            return;
        }
        for peer in self.peer_list().await {
            let has_keypair = peer.keypairs.read().current_valid().is_some();
            if has_keypair {
                peer.send_keepalive();
            }
        }
    }

    pub(crate) async fn notify_handshake_done(&self, peer: &Arc<Peer<T>>) {
        if let Some(handshake_done) = &self.callbacks.handshake_done {
            let allowed_ips = peer.inner.lock().await.allowed_ips.clone();
            handshake_done(&peer.public_key, &allowed_ips);
        }
    }

    pub(crate) fn notify_unexpected_ip(&self, public_key: &PublicKey, src: IpAddr) {
        match &self.callbacks.unexpected_ip {
            Some(unexpected_ip) => unexpected_ip(public_key, src),
            None => log::info!("packet with disallowed inner source address {src}"),
        }
    }

    /// Drain the decryption and handshake queues, returning buffers to
    /// their pools. Called at close, after the workers have exited.
    pub(crate) async fn flush_packet_queues(&self) {
        if let Ok(mut decryption) = self.queues.decryption_rx.try_lock() {
            while decryption.try_recv().is_ok() {}
        }
        if let Ok(mut handshake) = self.queues.handshake_rx.try_lock() {
            while handshake.try_recv().is_ok() {}
        }
        let encryption_rx = self.queues.encryption.receiver();
        if let Ok(mut encryption) = encryption_rx.try_lock() {
            while encryption.try_recv().is_ok() {}
        }
    }
}
