//! Handshake state and message progression.
//!
//! A two-message IK-style exchange. The initiator sends its ephemeral, its
//! static key sealed to the responder, and a sealed timestamp; the responder
//! answers with its own ephemeral and a sealed empty confirmation. Both
//! sides then hold mirrored transport keys.

use std::time::Instant;

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::IntoBytes;

use super::{
    COOKIE_EXPIRATION_TIME, CONSTRUCTION, Keypair, LABEL_COOKIE, LABEL_MAC1, NoiseError,
    REKEY_TIMEOUT, aead_open, aead_seal, b2s_hash, b2s_keyed_mac_16, b2s_keyed_mac_16_2,
};
use crate::packet::wg::{
    CookieReply, HandshakeInit, HandshakeResp, MSG_HANDSHAKE_INIT, MSG_HANDSHAKE_RESP, TAG_LEN,
};

/// Per-peer handshake state.
///
/// Protected by the peer's handshake lock; the shared side is read by the
/// pipeline, the exclusive side is taken by handshake progression and the
/// [`SetPrivateKey`](crate::device::Device::set_private_key) barrier.
pub struct Handshake {
    remote_static: PublicKey,
    /// DH(device static private, `remote_static`). Recomputed whenever the
    /// device identity changes.
    pub(crate) precomputed_static_static: [u8; 32],
    /// When we last sent an initiation. `None` means long enough ago that a
    /// new one may always be sent.
    pub(crate) last_sent_handshake: Option<Instant>,
    /// When a handshake last completed in either role.
    pub(crate) last_complete: Option<Instant>,
    state: State,
    /// `mac1` of the last handshake message we sent, the AAD of any cookie
    /// reply challenging it.
    last_mac1: Option<[u8; 16]>,
    cookie: Option<Cookie>,
}

enum State {
    Idle,
    InitSent {
        local_index: u32,
        ephemeral: StaticSecret,
        chaining_key: [u8; 32],
    },
}

struct Cookie {
    value: [u8; 16],
    received: Instant,
}

/// A consumed, authenticated initiation, not yet bound to a peer.
pub struct IncomingInitiation {
    pub initiator_static: PublicKey,
    ephemeral: PublicKey,
    pub sender_idx: u32,
    chaining_key: [u8; 32],
}

/// Derive the chain shared by both sides over the initiation message.
///
/// `es` is DH(initiator ephemeral, responder static); `ss` is the
/// precomputed static-static secret.
fn initiation_chain(
    responder_public: &PublicKey,
    ephemeral: &PublicKey,
    es: &[u8; 32],
    ss: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let ck0 = b2s_hash(CONSTRUCTION, responder_public.as_bytes());
    let ck1 = b2s_hash(&ck0, ephemeral.as_bytes());
    let k_es = b2s_hash(&ck1, es);
    let ck2 = b2s_hash(&k_es, ss);
    (k_es, ck2)
}

fn response_keys(chaining_key: &[u8; 32], ephemeral: &PublicKey, ee: &[u8; 32]) -> [[u8; 32]; 3] {
    let ck3 = b2s_hash(chaining_key, ephemeral.as_bytes());
    let ck4 = b2s_hash(&ck3, ee);
    [
        b2s_hash(&ck4, b"key1"),
        b2s_hash(&ck4, b"key2"),
        b2s_hash(&ck4, b"confirm"),
    ]
}

fn timestamp() -> [u8; 12] {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&now.as_secs().to_be_bytes());
    out[8..].copy_from_slice(&now.subsec_nanos().to_be_bytes());
    out
}

impl Handshake {
    pub fn new(remote_static: PublicKey) -> Self {
        Handshake {
            remote_static,
            precomputed_static_static: [0; 32],
            last_sent_handshake: None,
            last_complete: None,
            state: State::Idle,
            last_mac1: None,
            cookie: None,
        }
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    /// Recompute the static-static secret against a new device private key.
    pub fn precompute(&mut self, private_key: &StaticSecret) {
        self.precomputed_static_static =
            private_key.diffie_hellman(&self.remote_static).to_bytes();
    }

    /// Whether an initiation has been sent and not yet answered.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::InitSent { .. })
    }

    /// Whether enough time has passed since the last sent initiation.
    pub fn may_initiate(&self) -> bool {
        self.last_sent_handshake
            .is_none_or(|sent| sent.elapsed() >= REKEY_TIMEOUT)
    }

    /// Rewind the initiation clock so the next handshake fires immediately.
    pub fn rewind_last_sent(&mut self) {
        self.last_sent_handshake = Instant::now().checked_sub(REKEY_TIMEOUT);
    }

    /// Drop any in-progress exchange, returning the index to retire.
    pub fn clear(&mut self) -> Option<u32> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::InitSent { local_index, .. } => Some(local_index),
            State::Idle => None,
        }
    }

    fn mac_fields(&mut self, key_base: &PublicKey, until_mac1: &[u8]) -> ([u8; 16], [u8; 16]) {
        let mac1 = b2s_keyed_mac_16(&b2s_hash(LABEL_MAC1, key_base.as_bytes()), until_mac1);
        self.last_mac1 = Some(mac1);
        let mac2 = match &self.cookie {
            Some(cookie) if cookie.received.elapsed() < COOKIE_EXPIRATION_TIME => {
                b2s_keyed_mac_16_2(&cookie.value, until_mac1, &mac1)
            }
            _ => [0; 16],
        };
        (mac1, mac2)
    }

    /// Build an initiation message. `local_index` must already be reserved
    /// in the device session table.
    pub fn create_initiation(
        &mut self,
        local_public: &PublicKey,
        local_index: u32,
    ) -> HandshakeInit {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let es = ephemeral.diffie_hellman(&self.remote_static).to_bytes();
        let (k_es, ck2) = initiation_chain(
            &self.remote_static,
            &ephemeral_public,
            &es,
            &self.precomputed_static_static,
        );

        let mut msg = HandshakeInit {
            msg_type: MSG_HANDSHAKE_INIT,
            reserved: [0; 3],
            sender_idx: local_index.into(),
            ephemeral: *ephemeral_public.as_bytes(),
            encrypted_static: [0; 32 + TAG_LEN],
            encrypted_timestamp: [0; 12 + TAG_LEN],
            mac1: [0; 16],
            mac2: [0; 16],
        };
        aead_seal(&k_es, 0, local_public.as_bytes(), &[], &mut msg.encrypted_static);
        let ts_key = b2s_hash(&ck2, b"timestamp");
        aead_seal(&ts_key, 0, &timestamp(), &[], &mut msg.encrypted_timestamp);

        let (mac1, mac2) = {
            let remote = self.remote_static;
            let until = HandshakeInit::until_mac1(msg.as_bytes()).to_vec();
            self.mac_fields(&remote, &until)
        };
        msg.mac1 = mac1;
        msg.mac2 = mac2;

        self.state = State::InitSent {
            local_index,
            ephemeral,
            chaining_key: ck2,
        };
        self.last_sent_handshake = Some(Instant::now());
        msg
    }

    /// Respond to a consumed initiation, completing the handshake in the
    /// responder role. `local_index` must already be reserved.
    pub fn create_response(
        &mut self,
        init: &IncomingInitiation,
        local_index: u32,
    ) -> (HandshakeResp, Keypair) {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let ee = ephemeral.diffie_hellman(&init.ephemeral).to_bytes();
        let [key1, key2, confirm] = response_keys(&init.chaining_key, &ephemeral_public, &ee);

        let mut msg = HandshakeResp {
            msg_type: MSG_HANDSHAKE_RESP,
            reserved: [0; 3],
            sender_idx: local_index.into(),
            receiver_idx: init.sender_idx.into(),
            ephemeral: *ephemeral_public.as_bytes(),
            encrypted_nothing: [0; TAG_LEN],
            mac1: [0; 16],
            mac2: [0; 16],
        };
        aead_seal(&confirm, 0, &[], &[], &mut msg.encrypted_nothing);

        let (mac1, mac2) = {
            let remote = self.remote_static;
            let until = HandshakeResp::until_mac1(msg.as_bytes()).to_vec();
            self.mac_fields(&remote, &until)
        };
        msg.mac1 = mac1;
        msg.mac2 = mac2;

        // The responder receives with the initiator's sending key.
        let keypair = Keypair::new(key2, key1, local_index, init.sender_idx, false);
        self.last_complete = Some(Instant::now());
        (msg, keypair)
    }

    /// Complete the handshake in the initiator role.
    pub fn consume_response(&mut self, msg: &HandshakeResp) -> Result<Keypair, NoiseError> {
        let State::InitSent {
            local_index,
            ephemeral,
            chaining_key,
        } = &self.state
        else {
            return Err(NoiseError::UnexpectedMessage);
        };
        if msg.receiver_idx.get() != *local_index {
            return Err(NoiseError::WrongIndex);
        }

        let their_ephemeral = PublicKey::from(msg.ephemeral);
        let ee = ephemeral.diffie_hellman(&their_ephemeral).to_bytes();
        let [key1, key2, confirm] = response_keys(chaining_key, &their_ephemeral, &ee);
        aead_open(&confirm, 0, &msg.encrypted_nothing, &[], &mut [])?;

        let keypair = Keypair::new(key1, key2, *local_index, msg.sender_idx.get(), true);
        self.state = State::Idle;
        self.last_complete = Some(Instant::now());
        Ok(keypair)
    }

    /// Absorb a cookie reply challenging our last handshake message.
    pub fn consume_cookie(&mut self, msg: &CookieReply) -> Result<(), NoiseError> {
        let mac1 = self.last_mac1.ok_or(NoiseError::UnexpectedMessage)?;

        let cookie_key = b2s_hash(LABEL_COOKIE, self.remote_static.as_bytes());
        let cipher = XChaCha20Poly1305::new((&cookie_key).into());
        let (body, tag) = msg.encrypted_cookie.split_at(16);
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(body);
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&msg.nonce),
                &mac1,
                &mut cookie,
                chacha20poly1305::Tag::from_slice(tag),
            )
            .map_err(|_| NoiseError::Decrypt)?;

        self.cookie = Some(Cookie {
            value: cookie,
            received: Instant::now(),
        });
        Ok(())
    }
}

/// Consume an initiation addressed to `local_static`, identifying the
/// initiator. The caller is responsible for looking the initiator up in the
/// peer map and rejecting unknown keys.
pub fn consume_initiation(
    local_static: &StaticSecret,
    local_public: &PublicKey,
    msg: &HandshakeInit,
) -> Result<IncomingInitiation, NoiseError> {
    let ephemeral = PublicKey::from(msg.ephemeral);
    let es = local_static.diffie_hellman(&ephemeral).to_bytes();

    let ck0 = b2s_hash(CONSTRUCTION, local_public.as_bytes());
    let ck1 = b2s_hash(&ck0, ephemeral.as_bytes());
    let k_es = b2s_hash(&ck1, &es);

    let mut initiator_static = [0u8; 32];
    aead_open(&k_es, 0, &msg.encrypted_static, &[], &mut initiator_static)?;
    let initiator_static = PublicKey::from(initiator_static);

    let ss = local_static.diffie_hellman(&initiator_static).to_bytes();
    let ck2 = b2s_hash(&k_es, &ss);

    let ts_key = b2s_hash(&ck2, b"timestamp");
    let mut ts = [0u8; 12];
    aead_open(&ts_key, 0, &msg.encrypted_timestamp, &[], &mut ts)?;

    Ok(IncomingInitiation {
        initiator_static,
        ephemeral,
        sender_idx: msg.sender_idx.get(),
        chaining_key: ck2,
    })
}
