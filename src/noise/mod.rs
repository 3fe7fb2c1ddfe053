//! The handshake and transport-key collaborators of the device core.
//!
//! This is a compact Noise-IK-flavored exchange: x25519 for all
//! Diffie-Hellman steps, Blake2s for hashing and MACs, ChaCha20Poly1305 for
//! all AEAD work. Wire compatibility with other implementations is a
//! non-goal; the shapes and lifetimes mirror the WireGuard design.

pub mod handshake;
mod index_table;
mod rate_limiter;

pub use index_table::IndexTable;
pub use rate_limiter::RateLimiter;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use blake2::digest::consts::{U16, U24};
use blake2::digest::{KeyInit as Blake2sKeyInit, Mac};
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit as _, Nonce, Tag, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use x25519_dalek::PublicKey;
use zerocopy::IntoBytes;

use crate::packet::wg::{DataHeader, MSG_DATA, TAG_LEN};
use crate::packet::{BufPool, PacketBuf};

// Timer constants, after the WireGuard paper.
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// A received cookie may be used in `mac2` for this long.
pub const COOKIE_EXPIRATION_TIME: Duration = Duration::from_secs(120);

pub(crate) const CONSTRUCTION: &[u8] = b"tarntun v1 blake2s chacha20poly1305";
pub(crate) const LABEL_MAC1: &[u8] = b"mac1----";
pub(crate) const LABEL_COOKIE: &[u8] = b"cookie--";

/// Errors of handshake progression and transport crypto.
///
/// On the inbound path these all result in a silent packet drop.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum NoiseError {
    #[error("invalid message MAC")]
    InvalidMac,
    #[error("AEAD open failed")]
    Decrypt,
    #[error("message does not match handshake state")]
    UnexpectedMessage,
    #[error("receiver index does not match an in-progress handshake")]
    WrongIndex,
}

pub(crate) fn b2s_hash(data1: &[u8], data2: &[u8]) -> [u8; 32] {
    let mut hash = Blake2s256::new();
    hash.update(data1);
    hash.update(data2);
    hash.finalize().into()
}

pub(crate) fn b2s_keyed_mac_16(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac: Blake2sMac<U16> = Blake2sKeyInit::new_from_slice(key).expect("key fits blake2s");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn b2s_keyed_mac_16_2(key: &[u8], data1: &[u8], data2: &[u8]) -> [u8; 16] {
    let mut mac: Blake2sMac<U16> = Blake2sKeyInit::new_from_slice(key).expect("key fits blake2s");
    Mac::update(&mut mac, data1);
    Mac::update(&mut mac, data2);
    mac.finalize().into_bytes().into()
}

pub(crate) fn b2s_mac_24(key: &[u8], data: &[u8]) -> [u8; 24] {
    let mut mac: Blake2sMac<U24> = Blake2sKeyInit::new_from_slice(key).expect("key fits blake2s");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

fn chacha_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// Seal `plaintext` into `out`, which must be `plaintext.len() + TAG_LEN`.
pub(crate) fn aead_seal(key: &[u8; 32], counter: u64, plaintext: &[u8], aad: &[u8], out: &mut [u8]) {
    debug_assert_eq!(out.len(), plaintext.len() + TAG_LEN);
    let (body, tag_out) = out.split_at_mut(plaintext.len());
    body.copy_from_slice(plaintext);
    let cipher = ChaCha20Poly1305::new(key.into());
    let tag = cipher
        .encrypt_in_place_detached(&chacha_nonce(counter), aad, body)
        .expect("sealing cannot fail");
    tag_out.copy_from_slice(tag.as_slice());
}

/// Open `ciphertext` (body plus trailing tag) into `out`, which must be
/// `ciphertext.len() - TAG_LEN`.
pub(crate) fn aead_open(
    key: &[u8; 32],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
    out: &mut [u8],
) -> Result<(), NoiseError> {
    let body_len = ciphertext.len().checked_sub(TAG_LEN).ok_or(NoiseError::Decrypt)?;
    debug_assert_eq!(out.len(), body_len);
    let (body, tag) = ciphertext.split_at(body_len);
    out.copy_from_slice(body);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt_in_place_detached(&chacha_nonce(counter), aad, out, Tag::from_slice(tag))
        .map_err(|_| NoiseError::Decrypt)
}

/// A pair of transport keys derived from a completed handshake.
#[derive(Debug)]
pub struct Keypair {
    send_key: [u8; 32],
    recv_key: [u8; 32],
    /// Our receiver index, registered in the device session table.
    pub local_index: u32,
    /// The remote's receiver index, written into outgoing data headers.
    pub remote_index: u32,
    /// Creation timestamp; the keypair expires by policy after
    /// [`REKEY_AFTER_TIME`].
    pub created: Instant,
    pub is_initiator: bool,
    sending_counter: AtomicU64,
    confirmed: AtomicBool,
    expired: AtomicBool,
}

impl Keypair {
    pub(crate) fn new(
        send_key: [u8; 32],
        recv_key: [u8; 32],
        local_index: u32,
        remote_index: u32,
        is_initiator: bool,
    ) -> Self {
        Keypair {
            send_key,
            recv_key,
            local_index,
            remote_index,
            created: Instant::now(),
            is_initiator,
            sending_counter: AtomicU64::new(0),
            // The initiator may send immediately; the responder's keypair is
            // confirmed by the first authenticated inbound data message.
            confirmed: AtomicBool::new(is_initiator),
            expired: AtomicBool::new(false),
        }
    }

    pub(crate) fn next_counter(&self) -> u64 {
        self.sending_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::Release);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Force the keypair out of service ahead of its natural lifetime.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire) || self.created.elapsed() >= REJECT_AFTER_TIME
    }

    /// Whether the sending side should arrange a fresh handshake.
    pub fn wants_rekey(&self) -> bool {
        self.is_expired() || self.created.elapsed() >= REKEY_AFTER_TIME
    }

    /// Encrypt `payload` into a complete data message written to `out`.
    pub(crate) fn seal(&self, counter: u64, payload: &[u8], out: &mut PacketBuf) {
        let header = DataHeader {
            msg_type: MSG_DATA,
            reserved: [0; 3],
            receiver_idx: self.remote_index.into(),
            counter: counter.into(),
        };
        out.extend_from_slice(header.as_bytes());

        let body_start = out.len();
        out.buf_mut().resize(body_start + payload.len() + TAG_LEN, 0);
        aead_seal(&self.send_key, counter, payload, &[], &mut out[body_start..]);
    }

    /// Decrypt the body of a data message (ciphertext plus tag) into `out`.
    ///
    /// An empty plaintext is a keepalive.
    pub(crate) fn open(
        &self,
        counter: u64,
        body: &[u8],
        pool: &BufPool,
    ) -> Result<PacketBuf, NoiseError> {
        let plain_len = body.len().checked_sub(TAG_LEN).ok_or(NoiseError::Decrypt)?;
        let mut out = pool.get();
        out.buf_mut().resize(plain_len, 0);
        aead_open(&self.recv_key, counter, body, &[], &mut out[..])?;
        Ok(out)
    }
}

/// The three keypair slots of a peer, rotated on handshake completion.
#[derive(Default)]
pub struct KeypairSlots {
    pub previous: Option<Arc<Keypair>>,
    pub current: Option<Arc<Keypair>>,
    pub next: Option<Arc<Keypair>>,
}

impl KeypairSlots {
    /// Install a keypair completed as initiator. Returns displaced keypairs
    /// so the caller can retire their session indices.
    pub fn install_current(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut displaced = Vec::new();
        displaced.extend(self.previous.take());
        self.previous = self.current.take();
        self.current = Some(keypair);
        displaced.extend(self.next.take());
        displaced
    }

    /// Install a keypair completed as responder, pending confirmation.
    pub fn install_next(&mut self, keypair: Arc<Keypair>) -> Option<Arc<Keypair>> {
        self.next.replace(keypair)
    }

    /// Promote `keypair` from next to current after its first authenticated
    /// inbound message. Returns the displaced keypair, if any.
    pub fn promote(&mut self, keypair: &Arc<Keypair>) -> Option<Arc<Keypair>> {
        if self
            .next
            .as_ref()
            .is_some_and(|next| Arc::ptr_eq(next, keypair))
        {
            let displaced = self.previous.take();
            self.previous = self.current.take();
            self.current = self.next.take();
            displaced
        } else {
            None
        }
    }

    /// The current keypair, if it is still usable for sending.
    pub fn current_valid(&self) -> Option<Arc<Keypair>> {
        self.current.as_ref().filter(|kp| !kp.is_expired()).cloned()
    }

    pub fn expire_all(&self) {
        for keypair in [&self.previous, &self.current, &self.next].into_iter().flatten() {
            keypair.expire();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Keypair>> {
        [&self.previous, &self.current, &self.next].into_iter().flatten()
    }
}

/// Validates the MAC fields of incoming handshake messages and issues cookie
/// replies when the device is under load.
///
/// Reinitialized whenever the device's static identity changes.
pub struct CookieChecker {
    keys: parking_lot::RwLock<CookieKeys>,
    /// Secret behind per-source-IP cookies; rotates with key changes, which
    /// is at least as often as the protocol requires.
    secret: [u8; 16],
    nonce_key: [u8; 32],
    nonce_ctr: AtomicU64,
    start_time: Instant,
}

#[derive(Default)]
struct CookieKeys {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
}

/// Use 128 and not 120 so the compiler can optimize out the division.
const COOKIE_REFRESH_SECS: u64 = 128;

impl CookieChecker {
    pub fn new() -> Self {
        let mut secret = [0u8; 16];
        OsRng.fill_bytes(&mut secret);
        let mut nonce_key = [0u8; 32];
        OsRng.fill_bytes(&mut nonce_key);
        CookieChecker {
            keys: parking_lot::RwLock::new(CookieKeys::default()),
            secret,
            nonce_key,
            nonce_ctr: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Derive the MAC keys from the device's public key.
    pub fn init(&self, public_key: &PublicKey) {
        let mut keys = self.keys.write();
        keys.mac1_key = b2s_hash(LABEL_MAC1, public_key.as_bytes());
        keys.cookie_key = b2s_hash(LABEL_COOKIE, public_key.as_bytes());
    }

    pub fn check_mac1(&self, until_mac1: &[u8], mac1: &[u8; 16]) -> bool {
        let keys = self.keys.read();
        let computed = b2s_keyed_mac_16(&keys.mac1_key, until_mac1);
        constant_time_eq::constant_time_eq(&computed, mac1)
    }

    /// Check `mac2` against the cookie currently valid for `src`.
    pub fn check_mac2(&self, src: std::net::IpAddr, until_mac1: &[u8], mac1: &[u8; 16], mac2: &[u8; 16]) -> bool {
        let cookie = self.current_cookie(src);
        let computed = b2s_keyed_mac_16_2(&cookie, until_mac1, mac1);
        constant_time_eq::constant_time_eq(&computed, mac2)
    }

    /// The cookie currently valid for `addr`, derived from the rotating
    /// secret rather than stored.
    fn current_cookie(&self, addr: std::net::IpAddr) -> [u8; 16] {
        let mut addr_bytes = [0u8; 16];
        match addr {
            std::net::IpAddr::V4(a) => addr_bytes[..4].copy_from_slice(&a.octets()),
            std::net::IpAddr::V6(a) => addr_bytes.copy_from_slice(&a.octets()),
        }
        let epoch = Instant::now().duration_since(self.start_time).as_secs() / COOKIE_REFRESH_SECS;
        b2s_keyed_mac_16_2(&self.secret, &epoch.to_le_bytes(), &addr_bytes)
    }

    fn nonce(&self) -> [u8; 24] {
        let ctr = self.nonce_ctr.fetch_add(1, Ordering::Relaxed);
        b2s_mac_24(&self.nonce_key, &ctr.to_le_bytes())
    }

    /// Build a cookie reply challenging the sender of a handshake message.
    pub fn create_reply(
        &self,
        sender_idx: u32,
        src: std::net::IpAddr,
        mac1: &[u8; 16],
    ) -> crate::packet::wg::CookieReply {
        use crate::packet::wg::{CookieReply, MSG_COOKIE_REPLY};

        let cookie = self.current_cookie(src);
        let nonce = self.nonce();
        let mut reply = CookieReply {
            msg_type: MSG_COOKIE_REPLY,
            reserved: [0; 3],
            receiver_idx: sender_idx.into(),
            nonce,
            encrypted_cookie: [0; 32],
        };

        let keys = self.keys.read();
        let cipher = XChaCha20Poly1305::new((&keys.cookie_key).into());
        let (body, tag_out) = reply.encrypted_cookie.split_at_mut(16);
        body.copy_from_slice(&cookie);
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), mac1, body)
            .expect("sealing cannot fail");
        tag_out.copy_from_slice(tag.as_slice());
        reply
    }
}

impl Default for CookieChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    #[test]
    fn seal_open_round_trip() {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        let plaintext = b"not much of a secret";
        let mut sealed = vec![0u8; plaintext.len() + TAG_LEN];
        aead_seal(&key, 7, plaintext, b"aad", &mut sealed);

        let mut opened = vec![0u8; plaintext.len()];
        aead_open(&key, 7, &sealed, b"aad", &mut opened).unwrap();
        assert_eq!(&opened, plaintext);

        // Wrong counter must fail.
        assert_eq!(
            aead_open(&key, 8, &sealed, b"aad", &mut opened),
            Err(NoiseError::Decrypt)
        );
    }

    #[test]
    fn keypair_slots_rotate() {
        let kp = |idx| Arc::new(Keypair::new([0; 32], [0; 32], idx, idx + 100, true));

        let mut slots = KeypairSlots::default();
        let displaced = slots.install_current(kp(1));
        assert!(displaced.is_empty());

        let displaced = slots.install_current(kp(2));
        assert!(displaced.is_empty());
        assert_eq!(slots.previous.as_ref().unwrap().local_index, 1);
        assert_eq!(slots.current.as_ref().unwrap().local_index, 2);

        // Installing a third displaces the oldest.
        let displaced = slots.install_current(kp(3));
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].local_index, 1);
    }

    #[test]
    fn responder_keypair_promotes_on_confirmation() {
        let mut slots = KeypairSlots::default();
        let next = Arc::new(Keypair::new([0; 32], [0; 32], 9, 10, false));
        assert!(!next.is_confirmed());

        slots.install_next(Arc::clone(&next));
        assert!(slots.current_valid().is_none());

        next.confirm();
        slots.promote(&next);
        assert!(slots.next.is_none());
        assert_eq!(slots.current_valid().unwrap().local_index, 9);
    }

    #[test]
    fn expire_all_marks_every_slot() {
        let mut slots = KeypairSlots::default();
        slots.install_current(Arc::new(Keypair::new([0; 32], [0; 32], 1, 2, true)));
        slots.install_next(Arc::new(Keypair::new([0; 32], [0; 32], 3, 4, false)));
        slots.expire_all();
        assert!(slots.iter().all(|kp| kp.is_expired()));
        assert!(slots.current_valid().is_none());
    }

    #[test]
    fn mac1_checks_out() {
        let checker = CookieChecker::new();
        let public = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        checker.init(&public);

        let msg = b"some handshake bytes";
        let mac1 = b2s_keyed_mac_16(&b2s_hash(LABEL_MAC1, public.as_bytes()), msg);
        assert!(checker.check_mac1(msg, &mac1));
        assert!(!checker.check_mac1(b"other bytes", &mac1));
    }
}
