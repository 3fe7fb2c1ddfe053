//! Tunnel wire formats.
//!
//! Four message kinds, discriminated by the first byte. Handshake messages
//! end in two 16-byte MAC fields; data messages are a 16-byte header
//! followed by the AEAD ciphertext and tag.

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian};

/// First byte of a handshake initiation.
pub const MSG_HANDSHAKE_INIT: u8 = 1;
/// First byte of a handshake response.
pub const MSG_HANDSHAKE_RESP: u8 = 2;
/// First byte of a cookie reply.
pub const MSG_COOKIE_REPLY: u8 = 3;
/// First byte of a transport data message.
pub const MSG_DATA: u8 = 4;

/// Length of the poly1305 tag trailing every AEAD ciphertext.
pub const TAG_LEN: usize = 16;

/// Handshake initiation message.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct HandshakeInit {
    pub msg_type: u8,
    pub reserved: [u8; 3],
    pub sender_idx: little_endian::U32,
    pub ephemeral: [u8; 32],
    pub encrypted_static: [u8; 32 + TAG_LEN],
    pub encrypted_timestamp: [u8; 12 + TAG_LEN],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInit {
    pub const LEN: usize = size_of::<Self>();

    /// The message bytes covered by `mac1` (everything before it).
    pub fn until_mac1(bytes: &[u8]) -> &[u8] {
        &bytes[..offset_of!(Self, mac1)]
    }
}

/// Handshake response message.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct HandshakeResp {
    pub msg_type: u8,
    pub reserved: [u8; 3],
    pub sender_idx: little_endian::U32,
    pub receiver_idx: little_endian::U32,
    pub ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; TAG_LEN],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResp {
    pub const LEN: usize = size_of::<Self>();

    pub fn until_mac1(bytes: &[u8]) -> &[u8] {
        &bytes[..offset_of!(Self, mac1)]
    }
}

/// Cookie reply message.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct CookieReply {
    pub msg_type: u8,
    pub reserved: [u8; 3],
    pub receiver_idx: little_endian::U32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 16 + TAG_LEN],
}

impl CookieReply {
    pub const LEN: usize = size_of::<Self>();
}

/// Header of a transport data message.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct DataHeader {
    pub msg_type: u8,
    pub reserved: [u8; 3],
    pub receiver_idx: little_endian::U32,
    pub counter: little_endian::U64,
}

impl DataHeader {
    pub const LEN: usize = size_of::<Self>();
}

/// A borrowed view of a parsed tunnel message.
pub enum WgMessage<'a> {
    HandshakeInit(&'a HandshakeInit),
    HandshakeResp(&'a HandshakeResp),
    CookieReply(&'a CookieReply),
    /// Data header plus the ciphertext-and-tag that follows it.
    Data(&'a DataHeader, &'a [u8]),
}

/// Parse a datagram into a [`WgMessage`].
///
/// Handshake messages must be exactly their fixed length; data messages must
/// carry at least a full tag after the header.
pub fn parse(bytes: &[u8]) -> Option<WgMessage<'_>> {
    match *bytes.first()? {
        MSG_HANDSHAKE_INIT => HandshakeInit::ref_from_bytes(bytes)
            .ok()
            .map(WgMessage::HandshakeInit),
        MSG_HANDSHAKE_RESP => HandshakeResp::ref_from_bytes(bytes)
            .ok()
            .map(WgMessage::HandshakeResp),
        MSG_COOKIE_REPLY => CookieReply::ref_from_bytes(bytes)
            .ok()
            .map(WgMessage::CookieReply),
        MSG_DATA => {
            let (header, body) = DataHeader::ref_from_prefix(bytes).ok()?;
            (body.len() >= TAG_LEN).then_some(WgMessage::Data(header, body))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn message_sizes() {
        assert_eq!(HandshakeInit::LEN, 148);
        assert_eq!(HandshakeResp::LEN, 92);
        assert_eq!(CookieReply::LEN, 64);
        assert_eq!(DataHeader::LEN, 16);
    }

    #[test]
    fn parse_round_trip() {
        let mut init = HandshakeInit::new_zeroed();
        init.msg_type = MSG_HANDSHAKE_INIT;
        init.sender_idx.set(77);
        match parse(init.as_bytes()) {
            Some(WgMessage::HandshakeInit(msg)) => assert_eq!(msg.sender_idx.get(), 77),
            _ => panic!("expected handshake initiation"),
        }

        let mut data = vec![0u8; DataHeader::LEN + TAG_LEN + 5];
        data[0] = MSG_DATA;
        match parse(&data) {
            Some(WgMessage::Data(_, body)) => assert_eq!(body.len(), TAG_LEN + 5),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn truncated_messages_are_rejected() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[MSG_HANDSHAKE_INIT; 10]).is_none());
        assert!(parse(&[MSG_DATA; DataHeader::LEN + TAG_LEN - 1]).is_none());
        assert!(parse(&[9; 64]).is_none());
    }
}
