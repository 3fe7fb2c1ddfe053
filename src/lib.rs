//! An embeddable device core for WireGuard-style encrypted tunnels.
//!
//! The [`device`] module owns a tunnel interface, a set of remote peers and
//! an authenticated UDP socket, and runs the packet pipeline that moves
//! plaintext between the two. The [`tun`] and [`udp`] modules define the
//! transport abstractions a device is generic over.

pub mod device;

pub mod noise;
pub mod packet;
pub mod tun;
pub mod udp;

mod task;

/// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{
        EphemeralSecret, PublicKey, ReusableSecret, SharedSecret, StaticSecret,
    };
}
