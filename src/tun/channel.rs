//! An in-process [`TunDevice`] backed by tokio channels.
//!
//! The "application" half is a [`TunHandle`]: packets sent through it appear
//! as reads on the device side, and packets the device writes pop out of
//! [`TunHandle::recv`]. Used by tests and by anyone stacking a device on an
//! in-memory packet source.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{TunDevice, TunEvent};
use crate::packet::{BufPool, PacketBuf};

const DEFAULT_MTU: u16 = 1420;

/// Create a connected ([`ChannelTun`], [`TunHandle`]) pair.
pub fn channel_tun(capacity: usize) -> (ChannelTun, TunHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(8);

    let tun = ChannelTun {
        inject_rx: Arc::new(Mutex::new(inject_rx)),
        outbound_tx,
        events: std::sync::Mutex::new(Some(event_rx)),
        closed: Arc::new(AtomicBool::new(false)),
    };
    let handle = TunHandle {
        inject_tx,
        outbound_rx,
        event_tx,
        closed: Arc::clone(&tun.closed),
    };
    (tun, handle)
}

/// The device-facing half of a channel TUN.
pub struct ChannelTun {
    inject_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    events: std::sync::Mutex<Option<mpsc::Receiver<TunEvent>>>,
    closed: Arc<AtomicBool>,
}

/// The application-facing half of a channel TUN.
pub struct TunHandle {
    inject_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<TunEvent>,
    closed: Arc<AtomicBool>,
}

impl TunDevice for ChannelTun {
    async fn read(&self, pool: &BufPool) -> io::Result<PacketBuf> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let packet = self
            .inject_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let mut buf = pool.get();
        buf.extend_from_slice(&packet);
        Ok(buf)
    }

    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.outbound_tx
            .send(packet.to_vec())
            .await
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    fn mtu(&self) -> io::Result<u16> {
        Ok(DEFAULT_MTU)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TunEvent>> {
        self.events.lock().unwrap().take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inject_rx.try_lock().map(|mut rx| rx.close()).ok();
    }
}

impl TunHandle {
    /// Inject a packet, to be read by the device's TUN reader.
    pub async fn inject(&self, packet: impl Into<Vec<u8>>) -> io::Result<()> {
        self.inject_tx
            .send(packet.into())
            .await
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    /// Receive a packet the device wrote to the TUN.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound_rx.recv().await
    }

    /// Emit a link event, delivered to the device's TUN event reader.
    pub async fn send_event(&self, event: TunEvent) {
        let _ = self.event_tx.send(event).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
