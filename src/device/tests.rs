#![cfg(test)]

mod mock;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::device::queue::HandshakeElement;
use crate::device::{Config, Error, PeerConfig};
use crate::noise::Keypair;
use crate::udp::channel::ChannelNetwork;

use mock::{ipv4_packet, key_pair, new_device, wait_for};

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

fn peer_cfg(
    public_key: x25519_dalek::PublicKey,
    endpoints: &str,
    keepalive: u16,
    allowed: &[&str],
) -> PeerConfig {
    PeerConfig {
        public_key,
        endpoints: endpoints.to_string(),
        persistent_keepalive: keepalive,
        allowed_ips: allowed.iter().map(|s| net(s)).collect(),
    }
}

/// Cold start with a single peer: ephemeral bind, routed allowed-IPs, one
/// keepalive queued.
#[test_log::test(tokio::test)]
async fn cold_start_single_peer() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (_, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "127.0.0.1:51820", 25, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&cfg).await.unwrap();
    d.device.up().await.unwrap();

    assert!(d.device.has_bind().await);
    let port = d.device.listen_port().await;
    assert!(port != 0, "an ephemeral port was assigned");
    assert!(network.port_in_use(port));

    let peer = d.device.lookup_peer(&public_b).await.expect("peer present");
    assert!(peer.is_running());

    let owner = d
        .device
        .inner()
        .allowed_ips
        .read()
        .find(IpAddr::from(Ipv4Addr::new(10, 0, 0, 2)))
        .cloned();
    assert!(owner.is_some_and(|owner| Arc::ptr_eq(&owner, &peer)));

    assert_eq!(peer.keepalives_sent(), 1);

    d.device.close().await;
}

/// Setting the private key to a peer's key removes that peer entirely.
#[test_log::test(tokio::test)]
async fn self_peer_removal() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (private_b, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "", 0, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&cfg).await.unwrap();
    assert!(d.device.lookup_peer(&public_b).await.is_some());

    d.device.set_private_key(Some(private_b)).await.unwrap();

    assert!(d.device.lookup_peer(&public_b).await.is_none());
    assert!(d.device.inner().peers_is_empty());
    assert!(
        d.device
            .inner()
            .allowed_ips
            .read()
            .find(IpAddr::from(Ipv4Addr::new(10, 0, 0, 2)))
            .is_none(),
        "routes are detached with the peer"
    );

    d.device.close().await;
}

/// Key rotation recomputes every peer's static-static secret and expires
/// current keypairs.
#[test_log::test(tokio::test)]
async fn set_private_key_recomputes_and_expires() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_1, _) = key_pair();
    let (private_2, _) = key_pair();
    let (_, public_x) = key_pair();
    let (_, public_y) = key_pair();

    let cfg = Config {
        private_key: Some(private_1),
        listen_port: 0,
        peers: vec![peer_cfg(public_x, "", 0, &[]), peer_cfg(public_y, "", 0, &[])],
    };
    d.device.reconfig(&cfg).await.unwrap();

    // Give one peer a live keypair to observe the expiry.
    let peer_x = d.device.lookup_peer(&public_x).await.unwrap();
    let keypair = Arc::new(Keypair::new([1; 32], [2; 32], 7, 8, true));
    peer_x.keypairs.write().install_current(Arc::clone(&keypair));
    assert!(!keypair.is_expired());

    d.device.set_private_key(Some(private_2.clone())).await.unwrap();

    for public in [public_x, public_y] {
        let peer = d.device.lookup_peer(&public).await.unwrap();
        let expected = private_2.diffie_hellman(&public).to_bytes();
        let actual = peer.handshake.read().await.precomputed_static_static;
        assert_eq!(actual, expected);
    }
    assert!(keypair.is_expired());

    // Setting the same key again is a no-op.
    d.device.set_private_key(Some(private_2)).await.unwrap();

    d.device.close().await;
}

/// A conflicting listen port surfaces as `PortInUse` and wipes the peers.
#[test_log::test(tokio::test)]
async fn reconfig_port_conflict_fails_closed() {
    use crate::udp::BindFactory as _;

    let network = ChannelNetwork::new();
    let factory = network.factory();
    let (_occupant, _) = factory.open(51821).await.unwrap();

    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (_, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a.clone()),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "", 0, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&cfg).await.unwrap();
    d.device.up().await.unwrap();
    assert!(d.device.has_bind().await);

    let conflicting = Config {
        listen_port: 51821,
        ..cfg
    };
    let err = d.device.reconfig(&conflicting).await.unwrap_err();
    assert!(matches!(err, Error::PortInUse));

    assert_eq!(d.device.inner().peer_count().await, 0, "fail closed");
    assert!(!d.device.has_bind().await);

    d.device.close().await;
}

/// The state machine settles on the last requested state.
#[test_log::test(tokio::test)]
async fn up_down_settles_on_last_request() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (_, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "", 25, &[])],
    };
    d.device.reconfig(&cfg).await.unwrap();

    // Concurrent requests must never wedge the device.
    let (up_result, down_result) = tokio::join!(d.device.up(), d.device.down());
    up_result.unwrap();
    down_result.unwrap();

    // Down arriving last wins.
    d.device.up().await.unwrap();
    d.device.down().await.unwrap();

    assert!(!d.device.is_up());
    assert!(!d.device.has_bind().await);
    let peer = d.device.lookup_peer(&public_b).await.unwrap();
    assert!(!peer.is_running());

    d.device.close().await;
}

/// Changing an endpoint with keepalive enabled fires a keepalive and
/// rewinds the handshake clock.
#[test_log::test(tokio::test)]
async fn reconfig_endpoint_change_triggers_keepalive_and_handshake() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (_, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a.clone()),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "1.1.1.1:51820", 0, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&cfg).await.unwrap();
    d.device.up().await.unwrap();

    let peer = d.device.lookup_peer(&public_b).await.unwrap();
    assert_eq!(peer.keepalives_sent(), 0);
    assert_eq!(peer.endpoint_addr().await, Some("1.1.1.1:51820".parse().unwrap()));

    let changed = Config {
        private_key: Some(private_a),
        listen_port: d.device.listen_port().await,
        peers: vec![peer_cfg(public_b, "2.2.2.2:51820", 10, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&changed).await.unwrap();

    assert_eq!(peer.endpoint_addr().await, Some("2.2.2.2:51820".parse().unwrap()));
    assert!(peer.keepalives_sent() >= 1);
    assert_eq!(peer.persistent_keepalive(), 10);

    // The staged keepalive finds no keypair and kicks off a handshake.
    wait_for(5, async || peer.handshake.read().await.in_progress()).await;

    d.device.close().await;
}

/// Reconfig is idempotent and `config()` sorts peers by public key.
#[test_log::test(tokio::test)]
async fn reconfig_idempotent_and_sorted() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();

    let mut peers = vec![];
    for i in 0..3u8 {
        let (_, public) = key_pair();
        peers.push(peer_cfg(
            public,
            &format!("10.9.{i}.1:51820"),
            u16::from(i) * 5,
            &["10.0.0.0/24", "192.168.1.0/24"],
        ));
    }
    let cfg = Config {
        private_key: Some(private_a),
        listen_port: 0,
        peers,
    };

    d.device.reconfig(&cfg).await.unwrap();
    let first = d.device.config().await;
    d.device.reconfig(&cfg).await.unwrap();
    let second = d.device.config().await;

    assert_eq!(first.peers.len(), 3);
    assert!(
        first
            .peers
            .windows(2)
            .all(|w| w[0].public_key.as_bytes() < w[1].public_key.as_bytes()),
        "peers sorted by public key"
    );

    assert_eq!(
        first.private_key.as_ref().map(|k| k.to_bytes()),
        second.private_key.as_ref().map(|k| k.to_bytes())
    );
    assert_eq!(first.listen_port, second.listen_port);
    for (p1, p2) in first.peers.iter().zip(&second.peers) {
        assert_eq!(p1.public_key, p2.public_key);
        assert_eq!(p1.endpoints, p2.endpoints);
        assert_eq!(p1.persistent_keepalive, p2.persistent_keepalive);
        assert_eq!(p1.allowed_ips, p2.allowed_ips);
    }

    d.device.close().await;
}

/// Close unblocks `wait()` and rejects further lifecycle operations.
#[test_log::test(tokio::test)]
async fn close_unblocks_wait() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);

    d.device.close().await;

    tokio::time::timeout(Duration::from_millis(100), d.device.wait())
        .await
        .expect("wait unblocks after close");
    assert!(matches!(d.device.up().await, Err(Error::Closed)));

    // Close is idempotent.
    d.device.close().await;
}

/// Closing under outbound load leaks no buffers: every envelope is either
/// delivered or returned to the pool.
#[test_log::test(tokio::test)]
async fn close_under_load_drains_cleanly() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let (private_a, _) = key_pair();
    let (_, public_b) = key_pair();

    let cfg = Config {
        private_key: Some(private_a),
        listen_port: 0,
        peers: vec![peer_cfg(public_b, "127.0.0.1:9", 0, &["10.0.0.2/32"])],
    };
    d.device.reconfig(&cfg).await.unwrap();
    d.device.up().await.unwrap();

    // Hand the peer transport keys so packets flow into the pipeline.
    let peer = d.device.lookup_peer(&public_b).await.unwrap();
    peer.keypairs
        .write()
        .install_current(Arc::new(Keypair::new([3; 32], [4; 32], 11, 12, true)));

    for i in 0..400u16 {
        let payload = i.to_be_bytes();
        d.tun
            .inject(ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], &payload))
            .await
            .unwrap();
    }

    d.device.close().await;

    let pool = &d.device.inner().pool;
    assert_eq!(
        pool.available(),
        pool.capacity(),
        "all pooled buffers returned after drain"
    );
}

/// The under-load predicate trips on queue depth and latches for a grace
/// window.
#[test_log::test(tokio::test)]
async fn under_load_latches() {
    let network = ChannelNetwork::new();
    let d = new_device(&network);
    let inner = d.device.inner();

    assert!(!inner.is_under_load());

    // Fill the handshake queue synchronously; on a current-thread runtime
    // the workers cannot drain it until we yield.
    let src = "127.0.0.1:1".parse().unwrap();
    for _ in 0..crate::device::QUEUE_HANDSHAKE_SIZE / 4 {
        let packet = inner.pool.get();
        inner
            .queues
            .handshake_tx
            .try_send(HandshakeElement { packet, src })
            .unwrap();
    }

    assert!(inner.is_under_load());
    // The latch holds even though nothing was added since.
    assert!(inner.is_under_load());

    d.device.close().await;
}

/// Two devices over the in-memory network: handshake completes and a data
/// packet crosses the tunnel intact.
#[test_log::test(tokio::test)]
async fn end_to_end_tunnel() {
    let network = ChannelNetwork::new();
    let a = new_device(&network);
    let mut b = new_device(&network);
    let (private_a, public_a) = key_pair();
    let (private_b, public_b) = key_pair();

    let cfg_a = Config {
        private_key: Some(private_a),
        listen_port: 52001,
        peers: vec![peer_cfg(public_b, "127.0.0.1:52002", 0, &["10.0.0.2/32"])],
    };
    let cfg_b = Config {
        private_key: Some(private_b),
        listen_port: 52002,
        peers: vec![peer_cfg(public_a, "127.0.0.1:52001", 0, &["10.0.0.1/32"])],
    };
    a.device.reconfig(&cfg_a).await.unwrap();
    b.device.reconfig(&cfg_b).await.unwrap();
    a.device.up().await.unwrap();
    b.device.up().await.unwrap();

    // A keepalive with no keys arranges the handshake.
    let peer_b_on_a = a.device.lookup_peer(&public_b).await.unwrap();
    let peer_a_on_b = b.device.lookup_peer(&public_a).await.unwrap();
    peer_b_on_a.send_keepalive();

    wait_for(5, async || {
        peer_b_on_a.keypairs.read().current_valid().is_some()
    })
    .await;
    wait_for(5, async || {
        peer_a_on_b.keypairs.read().current_valid().is_some()
    })
    .await;

    assert!(peer_b_on_a.last_handshake().await.is_some());
    assert!(peer_a_on_b.last_handshake().await.is_some());

    let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"hello tunnel");
    a.tun.inject(packet.clone()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), b.tun.recv())
        .await
        .expect("packet crosses the tunnel")
        .expect("tun open");
    assert_eq!(received, packet);
    assert!(peer_a_on_b.rx_bytes() >= packet.len() as u64);

    a.device.close().await;
    b.device.close().await;
}

/// A decrypted packet with an inner source outside the peer's allowed IPs
/// is dropped and reported.
#[test_log::test(tokio::test)]
async fn unexpected_inner_source_is_dropped() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let network = ChannelNetwork::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = Arc::clone(&hits);
    let options = crate::device::DeviceOptions {
        unexpected_ip: Some(Box::new(move |_, _| {
            hits_cb.fetch_add(1, Ordering::Relaxed);
        })),
        ..Default::default()
    };

    let a = new_device(&network);
    let b = mock::new_device_with_options(&network, options);
    let (private_a, public_a) = key_pair();
    let (private_b, public_b) = key_pair();

    let cfg_a = Config {
        private_key: Some(private_a),
        listen_port: 52011,
        peers: vec![peer_cfg(public_b, "127.0.0.1:52012", 0, &["0.0.0.0/0"])],
    };
    // B only accepts 10.0.0.1 from A.
    let cfg_b = Config {
        private_key: Some(private_b),
        listen_port: 52012,
        peers: vec![peer_cfg(public_a, "127.0.0.1:52011", 0, &["10.0.0.1/32"])],
    };
    a.device.reconfig(&cfg_a).await.unwrap();
    b.device.reconfig(&cfg_b).await.unwrap();
    a.device.up().await.unwrap();
    b.device.up().await.unwrap();

    let peer_b_on_a = a.device.lookup_peer(&public_b).await.unwrap();
    peer_b_on_a.send_keepalive();
    wait_for(5, async || {
        peer_b_on_a.keypairs.read().current_valid().is_some()
    })
    .await;

    // Spoofed inner source: allowed by A's routes, rejected by B's.
    a.tun
        .inject(ipv4_packet([192, 168, 7, 7], [10, 0, 0, 2], b"spoof"))
        .await
        .unwrap();

    wait_for(5, async || hits.load(Ordering::Relaxed) > 0).await;

    a.device.close().await;
    b.device.close().await;
}
