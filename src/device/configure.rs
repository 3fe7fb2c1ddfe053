//! Whole-configuration apply and read-back.
//!
//! [`Device::reconfig`] diffs a desired [`Config`] against the live device:
//! peers absent from the config are removed, the identity and listen port
//! are updated, and per-peer fields are replaced only where they actually
//! changed. A failed reconfig wipes the peer set: fail closed rather than
//! half-configured.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{Device, DeviceTransports, Error, Peer};

/// A complete device configuration.
#[derive(Clone, Default)]
pub struct Config {
    /// The device's private key; `None` is the zero key.
    pub private_key: Option<StaticSecret>,
    /// The desired listen port; 0 requests an ephemeral one.
    pub listen_port: u16,
    /// Unordered on input; [`Device::config`] emits it sorted by public
    /// key.
    pub peers: Vec<PeerConfig>,
}

/// One peer's configuration.
#[derive(Clone)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// Comma-separated `host:port` list; empty means unset.
    pub endpoints: String,
    /// Persistent keepalive interval in seconds; 0 disables.
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNetwork>,
}

impl PeerConfig {
    pub fn new(public_key: PublicKey) -> Self {
        PeerConfig {
            public_key,
            endpoints: String::new(),
            persistent_keepalive: 0,
            allowed_ips: Vec::new(),
        }
    }
}

impl<T: DeviceTransports> Device<T> {
    /// Replace the device configuration with `cfg`.
    ///
    /// Not serialized against concurrent callers; configuration edits are
    /// single-threaded at the caller. On error the peer set is wiped.
    pub async fn reconfig(&self, cfg: &Config) -> Result<(), Error> {
        let result = self.apply_config(cfg).await;
        if let Err(err) = &result {
            log::debug!("reconfig failed, removing all peers: {err}");
            self.remove_all_peers().await;
        }
        result
    }

    async fn apply_config(&self, cfg: &Config) -> Result<(), Error> {
        let inner = self.inner();
        if inner.is_closed() {
            return Err(Error::Closed);
        }

        // Remove peers absent from the new configuration.
        let mut stale: HashSet<PublicKey> = {
            let peers = inner.peer_list().await;
            peers.iter().map(|peer| peer.public_key).collect()
        };
        for peer_cfg in &cfg.peers {
            stale.remove(&peer_cfg.public_key);
        }
        for public_key in stale {
            log::debug!("reconfig: removing old peer");
            inner.remove_peer(&public_key).await;
        }

        // Identity.
        let key_differs = {
            let identity = inner.static_identity.read().await;
            identity.key_pair.as_ref().map(|kp| kp.1)
                != cfg.private_key.as_ref().map(PublicKey::from)
        };
        if key_differs {
            log::debug!("reconfig: resetting private key");
            inner.set_private_key(cfg.private_key.clone()).await?;
        }

        // Listen port, then rebind.
        {
            inner.net.write().await.port = cfg.listen_port;
        }
        if inner.bind_update().await.is_err() {
            return Err(Error::PortInUse);
        }

        // Peers.
        let mut keepalive_peers: Vec<Arc<Peer<T>>> = Vec::new();
        let mut mark_for_keepalive = |peer: &Arc<Peer<T>>, list: &mut Vec<Arc<Peer<T>>>| {
            if !list.iter().any(|known| Arc::ptr_eq(known, peer)) {
                list.push(Arc::clone(peer));
            }
        };

        for peer_cfg in &cfg.peers {
            let (peer, is_new) = match inner.lookup_peer(&peer_cfg.public_key).await {
                Some(peer) => (peer, false),
                None => {
                    log::debug!("reconfig: new peer");
                    (inner.new_peer(peer_cfg.public_key).await?, true)
                }
            };

            if is_new && peer_cfg.persistent_keepalive != 0 && inner.is_up() {
                mark_for_keepalive(&peer, &mut keepalive_peers);
            }

            peer.persistent_keepalive
                .store(u32::from(peer_cfg.persistent_keepalive), Ordering::Relaxed);

            // Endpoint: replaced only when the configured address list
            // actually changed.
            if !peer_cfg.endpoints.is_empty() {
                let endpoint_changed = {
                    let peer_inner = peer.inner.lock().await;
                    peer_inner
                        .endpoint
                        .as_ref()
                        .is_none_or(|ep| !endpoints_equal(&peer_cfg.endpoints, &ep.addrs()))
                };
                if endpoint_changed {
                    let endpoint = (inner.callbacks.create_endpoint)(
                        &peer_cfg.public_key,
                        &peer_cfg.endpoints,
                    )
                    .map_err(Error::Endpoint)?;
                    peer.inner.lock().await.endpoint = Some(endpoint);

                    if peer_cfg.persistent_keepalive != 0 && inner.is_up() {
                        mark_for_keepalive(&peer, &mut keepalive_peers);
                        // Make sure a fresh handshake fires for the new
                        // endpoint.
                        peer.handshake.write().await.rewind_last_sent();
                    }
                }
            }

            // Allowed IPs: route removal dominates reconfigure time on
            // large fleets, so skip it when the set is unchanged.
            let allowed_ips_changed = {
                let peer_inner = peer.inner.lock().await;
                !cidrs_equal(&peer_inner.allowed_ips, &peer_cfg.allowed_ips)
            };
            if allowed_ips_changed {
                peer.inner.lock().await.allowed_ips = peer_cfg.allowed_ips.clone();
                let mut table = inner.allowed_ips.write();
                table.remove(|candidate| Arc::ptr_eq(candidate, &peer));
                for network in &peer_cfg.allowed_ips {
                    table.insert(*network, Arc::clone(&peer));
                }
            }
        }

        // Fire the keepalives marked above.
        for peer in keepalive_peers {
            log::debug!("reconfig: sending keepalive");
            peer.send_keepalive();
        }

        Ok(())
    }

    /// The live configuration, with peers sorted by public key ascending.
    pub async fn config(&self) -> Config {
        let inner = self.inner();

        let listen_port = inner.net.read().await.port;
        let private_key = inner
            .static_identity
            .read()
            .await
            .key_pair
            .as_ref()
            .map(|kp| kp.0.clone());

        let mut peers = Vec::new();
        for peer in inner.peer_list().await {
            let peer_inner = peer.inner.lock().await;
            peers.push(PeerConfig {
                public_key: peer.public_key,
                endpoints: peer_inner
                    .endpoint
                    .as_ref()
                    .map(|ep| ep.addrs())
                    .unwrap_or_default(),
                persistent_keepalive: peer.persistent_keepalive(),
                allowed_ips: peer_inner.allowed_ips.clone(),
            });
        }
        peers.sort_by(|a, b| a.public_key.as_bytes().cmp(b.public_key.as_bytes()));

        Config {
            private_key,
            listen_port,
            peers,
        }
    }
}

/// Order-insensitive equality of comma-separated endpoint lists, with a
/// fast path for identical inputs.
fn endpoints_equal(x: &str, y: &str) -> bool {
    if x == y {
        return true;
    }
    let mut xs: Vec<&str> = x.split(',').map(str::trim).collect();
    let mut ys: Vec<&str> = y.split(',').map(str::trim).collect();
    if xs.len() != ys.len() {
        return false;
    }
    xs.sort_unstable();
    ys.sort_unstable();
    xs == ys
}

/// Order-insensitive equality of prefix lists, comparing in order first to
/// avoid allocating.
fn cidrs_equal(x: &[IpNetwork], y: &[IpNetwork]) -> bool {
    if x.len() != y.len() {
        return false;
    }
    if x.iter().zip(y).all(|(a, b)| a == b) {
        return true;
    }
    let set: HashSet<&IpNetwork> = x.iter().collect();
    y.iter().all(|network| set.contains(network))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn endpoints_equality_ignores_order() {
        assert!(endpoints_equal("1.1.1.1:1", "1.1.1.1:1"));
        assert!(endpoints_equal("1.1.1.1:1,2.2.2.2:2", "2.2.2.2:2,1.1.1.1:1"));
        assert!(endpoints_equal("1.1.1.1:1, 2.2.2.2:2", "2.2.2.2:2,1.1.1.1:1"));
        assert!(!endpoints_equal("1.1.1.1:1", "2.2.2.2:2"));
        assert!(!endpoints_equal("1.1.1.1:1", "1.1.1.1:1,2.2.2.2:2"));
    }

    #[test]
    fn cidrs_equality_ignores_order() {
        let a = [net("10.0.0.0/8"), net("192.168.0.0/16")];
        let b = [net("192.168.0.0/16"), net("10.0.0.0/8")];
        assert!(cidrs_equal(&a, &a));
        assert!(cidrs_equal(&a, &b));
        assert!(!cidrs_equal(&a, &a[..1]));
        assert!(!cidrs_equal(&a, &[net("10.0.0.0/8"), net("10.0.0.0/9")]));
    }
}
