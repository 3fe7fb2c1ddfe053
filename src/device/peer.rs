use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use ipnetwork::IpNetwork;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::IntoBytes;

use crate::noise::handshake::Handshake;
use crate::noise::KeypairSlots;
use crate::packet::PacketBuf;
use crate::udp::{Bind as _, Endpoint, StringEndpoint};

use super::pipeline;
use super::queue::{InboundTicket, OutboundTicket};
use super::{DeviceInner, DeviceTransports, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE, QUEUE_STAGED_SIZE, Session};

/// A remote peer owned by the device's peer map.
///
/// Holds a non-owning back-reference to the device; a `Peer` is only
/// reachable while its map entry exists, and removal from the map
/// happens-before the last strong reference drops.
pub struct Peer<T: DeviceTransports> {
    pub(crate) device: Weak<DeviceInner<T>>,
    pub public_key: PublicKey,

    pub(crate) inner: AsyncMutex<PeerInner>,
    /// `Arc` so the private-key barrier can hold owned guards across the
    /// whole peer set at once.
    pub(crate) handshake: Arc<AsyncRwLock<Handshake>>,
    pub(crate) keypairs: parking_lot::RwLock<KeypairSlots>,

    pub(crate) persistent_keepalive: AtomicU32,
    running: AtomicBool,

    // Staged plaintext, consumed in arrival order by the staging routine.
    staged_tx: mpsc::Sender<PacketBuf>,
    pub(crate) staged_rx: Arc<AsyncMutex<mpsc::Receiver<PacketBuf>>>,
    // Encrypted-in-order tickets, consumed by the sequential sender.
    pub(crate) outbound_tx: mpsc::Sender<OutboundTicket>,
    pub(crate) outbound_rx: Arc<AsyncMutex<mpsc::Receiver<OutboundTicket>>>,
    // Decrypted-in-order tickets, consumed by the sequential receiver.
    pub(crate) inbound_tx: mpsc::Sender<InboundTicket>,
    pub(crate) inbound_rx: Arc<AsyncMutex<mpsc::Receiver<InboundTicket>>>,

    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    keepalives_staged: AtomicU64,
    pub(crate) last_sent_packet: parking_lot::Mutex<Option<Instant>>,
    pub(crate) last_recv_packet: parking_lot::Mutex<Option<Instant>>,
}

pub(crate) struct PeerInner {
    pub endpoint: Option<Box<dyn Endpoint>>,
    pub allowed_ips: Vec<IpNetwork>,
    tasks: JoinSet<()>,
    stop: Option<CancellationToken>,
}

impl<T: DeviceTransports> Peer<T> {
    pub(crate) fn new(
        device: Weak<DeviceInner<T>>,
        public_key: PublicKey,
        private_key: Option<&StaticSecret>,
    ) -> Arc<Self> {
        let mut handshake = Handshake::new(public_key);
        if let Some(private_key) = private_key {
            handshake.precompute(private_key);
        }

        let (staged_tx, staged_rx) = mpsc::channel(QUEUE_STAGED_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_OUTBOUND_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_INBOUND_SIZE);

        Arc::new(Peer {
            device,
            public_key,
            inner: AsyncMutex::new(PeerInner {
                endpoint: None,
                allowed_ips: Vec::new(),
                tasks: JoinSet::new(),
                stop: None,
            }),
            handshake: Arc::new(AsyncRwLock::new(handshake)),
            keypairs: parking_lot::RwLock::new(KeypairSlots::default()),
            persistent_keepalive: AtomicU32::new(0),
            running: AtomicBool::new(false),
            staged_tx,
            staged_rx: Arc::new(AsyncMutex::new(staged_rx)),
            outbound_tx,
            outbound_rx: Arc::new(AsyncMutex::new(outbound_rx)),
            inbound_tx,
            inbound_rx: Arc::new(AsyncMutex::new(inbound_rx)),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            keepalives_staged: AtomicU64::new(0),
            last_sent_packet: parking_lot::Mutex::new(None),
            last_recv_packet: parking_lot::Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the per-peer workers: staging, sequential sender, sequential
    /// receiver and timers. Idempotent.
    pub(crate) async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(device) = self.device.upgrade() else {
            self.running.store(false, Ordering::Release);
            return;
        };
        if device.is_closed() {
            self.running.store(false, Ordering::Release);
            return;
        }

        let stop = device.stop.child_token();
        let mut inner = self.inner.lock().await;
        inner.stop = Some(stop.clone());

        // The staging routine is this peer's producer reference on the
        // encryption queue; the reference dies with the routine.
        if let Some(encryption) = device.queues.encryption.subscribe() {
            inner.tasks.spawn(pipeline::routine_staging(
                Arc::clone(self),
                encryption,
                stop.clone(),
            ));
        }
        inner
            .tasks
            .spawn(pipeline::routine_sequential_sender(Arc::clone(self), stop.clone()));
        inner
            .tasks
            .spawn(pipeline::routine_sequential_receiver(Arc::clone(self), stop.clone()));
        inner
            .tasks
            .spawn(pipeline::routine_timers(Arc::clone(self), stop));

        log::debug!("peer started");
    }

    /// Stop the per-peer workers, drain the peer's queues and zero its
    /// sessions. May block; never call with the peer map locked.
    pub(crate) async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut inner = self.inner.lock().await;
        if let Some(stop) = inner.stop.take() {
            stop.cancel();
        }
        inner.tasks.shutdown().await;
        drop(inner);

        // Return every staged and in-flight buffer to its pool.
        if let Ok(mut staged) = self.staged_rx.try_lock() {
            while staged.try_recv().is_ok() {}
        }
        if let Ok(mut outbound) = self.outbound_rx.try_lock() {
            while outbound.try_recv().is_ok() {}
        }
        if let Ok(mut inbound) = self.inbound_rx.try_lock() {
            while inbound.try_recv().is_ok() {}
        }

        // Retire the handshake and every keypair session.
        let cleared = self.handshake.write().await.clear();
        if let Some(device) = self.device.upgrade() {
            if let Some(index) = cleared {
                device.sessions.remove(index);
            }
            let slots = std::mem::take(&mut *self.keypairs.write());
            for keypair in slots.iter() {
                device.sessions.remove(keypair.local_index);
            }
        } else {
            *self.keypairs.write() = KeypairSlots::default();
        }

        log::debug!("peer stopped");
    }

    /// Queue a plaintext packet for this peer. Drops when the peer is not
    /// running or its staged queue is full.
    pub(crate) fn stage(&self, packet: PacketBuf) {
        if !self.is_running() {
            return;
        }
        if self.staged_tx.try_send(packet).is_err() {
            log::trace!("staged queue full; dropping packet");
        }
    }

    /// Queue an empty authenticated packet. Falls back to arranging a
    /// handshake when no transport keys exist yet.
    pub fn send_keepalive(&self) {
        self.keepalives_staged.fetch_add(1, Ordering::Relaxed);
        let Some(device) = self.device.upgrade() else {
            return;
        };
        self.stage(device.pool.get());
    }

    /// The number of keepalives queued so far.
    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives_staged.load(Ordering::Relaxed)
    }

    pub fn persistent_keepalive(&self) -> u16 {
        self.persistent_keepalive.load(Ordering::Relaxed) as u16
    }

    /// Force the next handshake to derive fresh keys.
    pub(crate) fn expire_current_keypairs(&self) {
        self.keypairs.read().expire_all();
    }

    /// Send a handshake initiation, rate limited by the rekey timeout
    /// unless `is_retry`.
    pub(crate) async fn initiate_handshake(self: &Arc<Self>, is_retry: bool) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        let key_pair = device.static_identity.read().await.key_pair.clone();
        let Some((_, local_public)) = key_pair else {
            return;
        };

        let packet = {
            let mut handshake = self.handshake.write().await;
            if !is_retry && !handshake.may_initiate() {
                return;
            }
            if let Some(old_index) = handshake.clear() {
                device.sessions.remove(old_index);
            }
            let local_index = device
                .sessions
                .insert(Session::Handshake(Arc::downgrade(self)));
            let msg = handshake.create_initiation(&local_public, local_index);
            let mut packet = device.pool.get();
            packet.extend_from_slice(msg.as_bytes());
            packet
        };

        match self.send_buffer(&device, &packet).await {
            Ok(()) => log::debug!("sent handshake initiation"),
            Err(err) => log::trace!("failed to send handshake initiation: {err}"),
        }
    }

    /// Send raw bytes to this peer's active endpoint through the current
    /// bind.
    pub(crate) async fn send_buffer(
        &self,
        device: &DeviceInner<T>,
        packet: &[u8],
    ) -> io::Result<()> {
        let bind = { device.net.read().await.bind.clone() };
        let Some(bind) = bind else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let dst = { self.inner.lock().await.endpoint.as_ref().map(|ep| ep.dst()) };
        let Some(dst) = dst else {
            return Err(io::ErrorKind::AddrNotAvailable.into());
        };
        bind.send_to(packet, dst).await
    }

    /// Update the active endpoint after an authenticated packet from
    /// `addr`.
    pub(crate) async fn set_endpoint_addr(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        match &mut inner.endpoint {
            Some(endpoint) => endpoint.set_dst(addr),
            None => inner.endpoint = Some(Box::new(StringEndpoint::from_addr(addr))),
        }
    }

    /// The active endpoint address, if any.
    pub async fn endpoint_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.endpoint.as_ref().map(|ep| ep.dst())
    }

    /// Time since the last completed handshake.
    pub async fn last_handshake(&self) -> Option<std::time::Duration> {
        self.handshake
            .read()
            .await
            .last_complete
            .map(|at| at.elapsed())
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}
