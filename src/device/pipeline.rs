//! The worker routines of the packet pipeline.
//!
//! Global workers (encryption, decryption, handshake, TUN reader, TUN event
//! reader) are spawned once at construction and counted in the device's
//! worker set; UDP receivers live with the bind; per-peer routines live
//! with their peer. Long-running routines hold only a `Weak` device
//! reference and exit when it is gone or the stop token fires.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use zerocopy::IntoBytes;

use crate::noise::handshake;
use crate::packet::{self, BufPool};
use crate::packet::wg::{self, DataHeader, HandshakeInit, HandshakeResp, WgMessage};
use crate::tun::{TunDevice as _, TunEvent};
use crate::udp::{Bind as _, IpVersion};

use super::peer::Peer;
use super::queue::{
    HandshakeElement, InboundElement, InboundTicket, OutboundElement, OutboundTicket,
    SharedReceiver,
};
use super::{DeviceInner, DeviceTransports, Session};

/// Receive from a worker-pool queue, racing the stop token. `None` means
/// "exit the routine" (stop fired or the queue closed).
macro_rules! pool_recv {
    ($stop:expr, $rx:expr) => {
        tokio::select! {
            _ = $stop.cancelled() => None,
            elem = async { $rx.lock().await.recv().await } => elem,
        }
    };
}

/// Encrypt outbound envelopes. Terminates when the ref-counted encryption
/// queue closes.
pub(crate) async fn routine_encryption(rx: SharedReceiver<OutboundElement>, pool: BufPool) {
    loop {
        let elem = { rx.lock().await.recv().await };
        let Some(elem) = elem else { break };

        let mut out = pool.get();
        elem.keypair.seal(elem.counter, &elem.packet, &mut out);
        // A send error means the ticket was dropped; `out` goes back to the
        // pool either way.
        let _ = elem.ready.send(out);
    }
    log::trace!("encryption worker stopped");
}

/// Decrypt inbound envelopes.
pub(crate) async fn routine_decryption(
    rx: SharedReceiver<InboundElement>,
    pool: BufPool,
    stop: CancellationToken,
) {
    loop {
        let Some(elem) = pool_recv!(stop, rx) else { break };

        let body = &elem.packet[DataHeader::LEN..];
        match elem.keypair.open(elem.counter, body, &pool) {
            Ok(plain) => {
                let _ = elem.ready.send(plain);
            }
            // Cryptographic failure: drop silently. The dangling ticket
            // tells the sequential receiver to skip this slot.
            Err(_) => drop(elem),
        }
    }
    log::trace!("decryption worker stopped");
}

/// Progress handshakes: consume initiations and responses, install
/// keypairs, answer with cookies under load.
pub(crate) async fn routine_handshake<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    rx: SharedReceiver<HandshakeElement>,
    stop: CancellationToken,
) {
    loop {
        let Some(elem) = pool_recv!(stop, rx) else { break };
        let Some(device) = device.upgrade() else { break };

        device.rate_limiter.try_reset_count();

        match wg::parse(&elem.packet) {
            Some(WgMessage::HandshakeInit(msg)) => {
                let until_mac1 = HandshakeInit::until_mac1(&elem.packet);
                if !device.cookie_checker.check_mac1(until_mac1, &{ msg.mac1 }) {
                    continue;
                }
                if device.is_under_load() {
                    if !device.rate_limiter.allow(elem.src.ip()) {
                        continue;
                    }
                    if !device.cookie_checker.check_mac2(
                        elem.src.ip(),
                        until_mac1,
                        &{ msg.mac1 },
                        &{ msg.mac2 },
                    ) {
                        let reply = device.cookie_checker.create_reply(
                            msg.sender_idx.get(),
                            elem.src.ip(),
                            &{ msg.mac1 },
                        );
                        let _ = device.send_raw(reply.as_bytes(), elem.src).await;
                        continue;
                    }
                }

                let key_pair = device.static_identity.read().await.key_pair.clone();
                let Some((private_key, public_key)) = key_pair else {
                    continue;
                };
                let Ok(init) = handshake::consume_initiation(&private_key, &public_key, msg)
                else {
                    continue;
                };
                let Some(peer) = device.lookup_peer(&init.initiator_static).await else {
                    continue;
                };

                let local_index = device
                    .sessions
                    .insert(Session::Handshake(Arc::downgrade(&peer)));
                let (resp, keypair) = {
                    let mut hs = peer.handshake.write().await;
                    hs.create_response(&init, local_index)
                };
                let keypair = Arc::new(keypair);
                device.sessions.replace(
                    local_index,
                    Session::Keypair {
                        peer: Arc::downgrade(&peer),
                        keypair: Arc::downgrade(&keypair),
                    },
                );
                if let Some(displaced) = peer.keypairs.write().install_next(Arc::clone(&keypair))
                {
                    device.sessions.remove(displaced.local_index);
                }
                peer.set_endpoint_addr(elem.src).await;

                if device.send_raw(resp.as_bytes(), elem.src).await.is_ok() {
                    log::debug!("responded to handshake initiation");
                }
                device.notify_handshake_done(&peer).await;
            }
            Some(WgMessage::HandshakeResp(msg)) => {
                let until_mac1 = HandshakeResp::until_mac1(&elem.packet);
                if !device.cookie_checker.check_mac1(until_mac1, &{ msg.mac1 }) {
                    continue;
                }
                if device.is_under_load()
                    && !device.cookie_checker.check_mac2(
                        elem.src.ip(),
                        until_mac1,
                        &{ msg.mac1 },
                        &{ msg.mac2 },
                    )
                {
                    let reply = device.cookie_checker.create_reply(
                        msg.sender_idx.get(),
                        elem.src.ip(),
                        &{ msg.mac1 },
                    );
                    let _ = device.send_raw(reply.as_bytes(), elem.src).await;
                    continue;
                }

                let Some(Session::Handshake(peer)) =
                    device.sessions.get(msg.receiver_idx.get())
                else {
                    continue;
                };
                let Some(peer) = peer.upgrade() else { continue };

                let keypair = {
                    let mut hs = peer.handshake.write().await;
                    match hs.consume_response(msg) {
                        Ok(keypair) => Arc::new(keypair),
                        Err(err) => {
                            log::trace!("dropping handshake response: {err}");
                            continue;
                        }
                    }
                };
                device.sessions.replace(
                    keypair.local_index,
                    Session::Keypair {
                        peer: Arc::downgrade(&peer),
                        keypair: Arc::downgrade(&keypair),
                    },
                );
                for displaced in peer.keypairs.write().install_current(Arc::clone(&keypair)) {
                    device.sessions.remove(displaced.local_index);
                }
                peer.set_endpoint_addr(elem.src).await;
                device.notify_handshake_done(&peer).await;
                log::debug!("handshake completed as initiator");

                // An immediate keepalive confirms the keypair for the
                // responder.
                peer.send_keepalive();
            }
            Some(WgMessage::CookieReply(msg)) => {
                let peer = match device.sessions.get(msg.receiver_idx.get()) {
                    Some(Session::Handshake(peer)) => peer.upgrade(),
                    Some(Session::Keypair { peer, .. }) => peer.upgrade(),
                    None => None,
                };
                let Some(peer) = peer else { continue };
                if peer.handshake.write().await.consume_cookie(msg).is_ok() {
                    log::debug!("absorbed cookie reply");
                }
            }
            // Data messages never land on this queue; receivers route them
            // straight to decryption.
            _ => continue,
        }
    }
    log::trace!("handshake worker stopped");
}

/// Read packets from the TUN, route them by destination and stage them on
/// the owning peer.
pub(crate) async fn routine_read_from_tun<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    stop: CancellationToken,
) {
    loop {
        let Some(device) = device.upgrade() else { break };
        let packet = tokio::select! {
            _ = stop.cancelled() => break,
            result = device.tun.read(&device.pool) => match result {
                Ok(packet) => packet,
                Err(err) => {
                    log::debug!("tun read failed: {err}");
                    break;
                }
            },
        };
        if packet.is_empty() {
            continue;
        }

        let Some(dst) = packet::destination_ip(&packet) else {
            continue;
        };
        let Some(peer) = device.allowed_ips.read().find(dst).cloned() else {
            // No route for the destination; drop.
            continue;
        };
        peer.stage(packet);
    }
    log::trace!("tun reader stopped");
}

/// Consume TUN link events: MTU updates and link up/down transitions.
pub(crate) async fn routine_tun_events<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    mut events: mpsc::Receiver<TunEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(device) = device.upgrade() else { break };

        let requested = match event {
            TunEvent::MtuUpdate(mtu) => {
                log::info!("MTU updated: {mtu}");
                device.set_mtu(mtu);
                continue;
            }
            TunEvent::Up(mtu) => {
                log::info!("interface up");
                device.set_mtu(mtu);
                true
            }
            TunEvent::Down => {
                log::info!("interface down");
                false
            }
        };
        // Race the transition against the stop token: close() may hold the
        // state lock while waiting for this very routine.
        tokio::select! {
            _ = stop.cancelled() => break,
            result = device.request_state(requested) => {
                if let Err(err) = result {
                    log::error!("failed to apply interface state: {err}");
                }
            }
        }
    }
    log::trace!("tun event reader stopped");
}

/// Receive datagrams of one IP version from the bind and feed the
/// decryption or handshake queue.
pub(crate) async fn routine_receive_incoming<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    bind: Arc<T::Bind>,
    version: IpVersion,
    stop: CancellationToken,
) {
    enum Kind {
        Data { index: u32, counter: u64 },
        Handshake,
        Invalid,
    }

    loop {
        let Some(device) = device.upgrade() else { break };
        let (packet, src) = tokio::select! {
            _ = stop.cancelled() => break,
            result = bind.recv_from(&device.pool, version) => match result {
                Ok(datagram) => datagram,
                // The bind was closed (or irrecoverably failed); the next
                // bind update starts fresh receivers.
                Err(_) => break,
            },
        };

        let kind = match wg::parse(&packet) {
            Some(WgMessage::Data(header, _)) => Kind::Data {
                index: header.receiver_idx.get(),
                counter: header.counter.get(),
            },
            Some(_) => Kind::Handshake,
            None => Kind::Invalid,
        };

        match kind {
            Kind::Data { index, counter } => {
                let Some(Session::Keypair { peer, keypair }) = device.sessions.get(index) else {
                    continue;
                };
                let (Some(peer), Some(keypair)) = (peer.upgrade(), keypair.upgrade()) else {
                    continue;
                };
                if !peer.is_running() {
                    continue;
                }

                let (ready_tx, ready_rx) = oneshot::channel();
                let ticket = InboundTicket {
                    ready: ready_rx,
                    keypair: Arc::clone(&keypair),
                    src,
                };
                if peer.inbound_tx.try_send(ticket).is_err() {
                    // Per-peer queue full; shed load.
                    continue;
                }
                let elem = InboundElement {
                    packet,
                    keypair,
                    counter,
                    ready: ready_tx,
                };
                let send = device.queues.decryption_tx.send(elem);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = send => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            Kind::Handshake => {
                let elem = HandshakeElement { packet, src };
                if device.queues.handshake_tx.try_send(elem).is_err() {
                    log::trace!("handshake queue full; dropping message");
                }
            }
            Kind::Invalid => continue,
        }
    }
    log::trace!("udp receiver stopped");
}

/// React to platform route changes: clear cached endpoint sources so the OS
/// re-chooses an egress, and nudge peers with live keypairs.
pub(crate) async fn routine_route_listener<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    mut route_changes: mpsc::Receiver<()>,
) {
    while route_changes.recv().await.is_some() {
        let Some(device) = device.upgrade() else { break };
        log::debug!("route change; clearing cached endpoint sources");
        device.clear_endpoint_srcs().await;
        device.send_keepalives_to_peers_with_current_keypair().await;
    }
}

/// Per-peer: move staged plaintext into the encryption queue, assigning
/// nonces in order. Owns this peer's producer reference on the queue.
pub(crate) async fn routine_staging<T: DeviceTransports>(
    peer: Arc<Peer<T>>,
    encryption: mpsc::Sender<OutboundElement>,
    stop: CancellationToken,
) {
    let staged = Arc::clone(&peer.staged_rx);
    loop {
        let Some(packet) = pool_recv!(stop, staged) else { break };

        let keypair = peer.keypairs.read().current_valid();
        let Some(keypair) = keypair else {
            // No usable transport keys: drop the packet and arrange a
            // handshake instead.
            drop(packet);
            peer.initiate_handshake(false).await;
            continue;
        };

        let counter = keypair.next_counter();
        let (ready_tx, ready_rx) = oneshot::channel();
        if peer.outbound_tx.try_send(OutboundTicket { ready: ready_rx }).is_err() {
            log::trace!("outbound queue full; dropping packet");
            continue;
        }
        let elem = OutboundElement {
            packet,
            keypair,
            counter,
            ready: ready_tx,
        };
        if encryption.send(elem).await.is_err() {
            break;
        }
    }
    log::trace!("staging routine stopped");
}

/// Per-peer: send encrypted packets in nonce order.
pub(crate) async fn routine_sequential_sender<T: DeviceTransports>(
    peer: Arc<Peer<T>>,
    stop: CancellationToken,
) {
    let outbound = Arc::clone(&peer.outbound_rx);
    loop {
        let Some(ticket) = pool_recv!(stop, outbound) else { break };
        let Ok(packet) = ticket.ready.await else {
            // Dropped by the encryption worker.
            continue;
        };
        let Some(device) = peer.device.upgrade() else { break };

        *peer.last_sent_packet.lock() = Some(std::time::Instant::now());
        match peer.send_buffer(&device, &packet).await {
            Ok(()) => {
                peer.tx_bytes
                    .fetch_add(packet.len() as u64, std::sync::atomic::Ordering::Relaxed);
            }
            Err(err) => log::trace!("failed to send packet: {err}"),
        }
    }
    log::trace!("sequential sender stopped");
}

/// Per-peer: deliver decrypted packets to the TUN in counter order,
/// enforcing the allowed-IPs of the decrypting peer.
pub(crate) async fn routine_sequential_receiver<T: DeviceTransports>(
    peer: Arc<Peer<T>>,
    stop: CancellationToken,
) {
    let inbound = Arc::clone(&peer.inbound_rx);
    loop {
        let Some(ticket) = pool_recv!(stop, inbound) else { break };
        let Ok(packet) = ticket.ready.await else {
            // Decryption failed; skip this slot.
            continue;
        };
        let Some(device) = peer.device.upgrade() else { break };

        // First authenticated inbound packet confirms a responder keypair.
        ticket.keypair.confirm();
        if let Some(displaced) = peer.keypairs.write().promote(&ticket.keypair) {
            device.sessions.remove(displaced.local_index);
        }

        *peer.last_recv_packet.lock() = Some(std::time::Instant::now());
        peer.set_endpoint_addr(ticket.src).await;

        if packet.is_empty() {
            log::trace!("received keepalive");
            continue;
        }

        let Some(src_ip) = packet::source_ip(&packet) else {
            continue;
        };
        let allowed = device
            .allowed_ips
            .read()
            .find(src_ip)
            .is_some_and(|owner| Arc::ptr_eq(owner, &peer));
        if !allowed {
            device.notify_unexpected_ip(&peer.public_key, src_ip);
            continue;
        }

        peer.rx_bytes
            .fetch_add(packet.len() as u64, std::sync::atomic::Ordering::Relaxed);
        if let Err(err) = device.tun.write(&packet).await {
            log::trace!("tun write failed: {err}");
        }
    }
    log::trace!("sequential receiver stopped");
}

/// Per-peer timers: persistent keepalives, rekeying of aging keypairs and
/// retries of unanswered initiations.
pub(crate) async fn routine_timers<T: DeviceTransports>(
    peer: Arc<Peer<T>>,
    stop: CancellationToken,
) {
    let period = Duration::from_secs(1);
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {}
        }

        let keepalive = peer.persistent_keepalive();
        if keepalive > 0 {
            // Keepalives hold NAT state open for an established session;
            // before any packet was sent there is nothing to keep alive.
            let due = peer
                .last_sent_packet
                .lock()
                .is_some_and(|at| at.elapsed() >= Duration::from_secs(u64::from(keepalive)));
            if due {
                peer.send_keepalive();
            }
        }

        // Initiator-side rekey as the current keypair ages out.
        let wants_rekey = {
            let slots = peer.keypairs.read();
            slots
                .current
                .as_ref()
                .is_some_and(|kp| kp.is_initiator && kp.wants_rekey())
        };
        if wants_rekey {
            peer.initiate_handshake(false).await;
        }

        // Retry initiations that went unanswered for a rekey timeout.
        let retry = {
            let hs = peer.handshake.read().await;
            hs.in_progress() && hs.may_initiate()
        };
        if retry {
            peer.initiate_handshake(true).await;
        }
    }
    log::trace!("timer routine stopped");
}
