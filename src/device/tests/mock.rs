//! Shared fixtures for device tests: an in-memory network and TUN, plus
//! small packet and key helpers.

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::device::{Device, DeviceOptions};
use crate::tun::channel::{ChannelTun, TunHandle, channel_tun};
use crate::udp::channel::{ChannelBindFactory, ChannelNetwork};

pub type TestTransports = (ChannelBindFactory, ChannelTun);

pub struct TestDevice {
    pub device: Device<TestTransports>,
    pub tun: TunHandle,
}

/// A device wired to `network` with a fresh channel TUN and default
/// callbacks.
pub fn new_device(network: &ChannelNetwork) -> TestDevice {
    new_device_with_options(network, DeviceOptions::default())
}

pub fn new_device_with_options(network: &ChannelNetwork, options: DeviceOptions) -> TestDevice {
    let (tun, handle) = channel_tun(64);
    let device = Device::new(tun, network.factory(), options);
    TestDevice {
        device,
        tun: handle,
    }
}

pub fn key_pair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// A barely passable IPv4 packet with the given addresses and payload.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet[20..].copy_from_slice(payload);
    packet
}

/// Await `predicate` becoming true, panicking after `secs` seconds.
pub async fn wait_for(secs: u64, mut predicate: impl AsyncFnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(secs);
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {secs}s");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
