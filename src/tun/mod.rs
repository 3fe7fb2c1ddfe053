//! Trait abstraction for TUN devices.
//!
//! The device core only needs to read and write whole IP packets, watch the
//! MTU, and observe link events. Anything that can do that can stand in for
//! a kernel TUN interface; [`channel`] provides an in-process
//! implementation used by tests and userspace plumbing.

pub mod channel;

use std::io;

use tokio::sync::mpsc;

use crate::packet::{BufPool, PacketBuf};

/// Events emitted by a TUN device, consumed by the device's event reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    /// The link came up with the given MTU.
    Up(u16),
    /// The link went down.
    Down,
    /// The MTU changed.
    MtuUpdate(u16),
}

/// A TUN device: a source and sink of whole IP packets.
pub trait TunDevice: Send + Sync + 'static {
    /// Read one IP packet into a pooled buffer.
    ///
    /// Only the device's TUN reader calls this; implementations may assume a
    /// single caller at a time.
    fn read(&self, pool: &BufPool) -> impl Future<Output = io::Result<PacketBuf>> + Send;

    /// Write one IP packet.
    fn write(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// The current MTU.
    fn mtu(&self) -> io::Result<u16>;

    /// Take the event stream. Returns `None` if already taken or if the
    /// implementation has no events to report.
    fn take_events(&self) -> Option<mpsc::Receiver<TunEvent>>;

    /// Close the device. Pending and future reads fail.
    fn close(&self);
}
