//! Wire codec for the encrypted control envelope.
//!
//! ```text
//! | type:u16 | len:u16 | seq:u32 | tag:[u8;16] | payload:[u8; len - 20] |
//! ```
//!
//! All integers are little-endian. `len` counts the bytes after the 4-byte
//! `type`/`len` header. The plaintext inside `payload` is a [`DecryptedMessage`]:
//! `type:u16 | size:u16 | body[size]`.
//!
//! This layer knows nothing about message semantics, and it does not allocate
//! sequence numbers either: callers pass the number to seal with, and the session
//! guarantees it is never reused.

use thiserror::Error;

use crate::crypto::{Direction, PacketCipher, TAG_LEN};

/// Envelope `type` value for encrypted control packets.
pub const ENVELOPE_TYPE: u16 = 0x0001;
/// Bytes of `type` + `len`.
pub const ENVELOPE_HEADER_LEN: usize = 4;
/// Bytes of `seq` + `tag` counted by `len` in addition to the ciphertext.
pub const ENVELOPE_OVERHEAD: usize = 4 + TAG_LEN;
/// Bytes of the decrypted message header (`type` + `size`).
pub const MESSAGE_HEADER_LEN: usize = 4;
/// Largest plaintext that still fits the 16-bit `len` field.
pub const MAX_PLAINTEXT_LEN: usize = u16::MAX as usize - ENVELOPE_OVERHEAD;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Tag verification failed; the packet carries no usable data.
    #[error("packet authentication failed")]
    AuthenticationFailed,
    /// Header fields are inconsistent with the datagram.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    /// The sequence number was not above the highest one already accepted.
    #[error("replayed sequence {seq} (high water {high_water})")]
    Replayed { seq: u32, high_water: u32 },
    /// The 32-bit send sequence space is used up; the key must be rotated.
    #[error("send sequence space exhausted")]
    SequenceExhausted,
    #[error("plaintext of {0} bytes does not fit an envelope")]
    TooLarge(usize),
    #[error("session already closed")]
    SessionClosed,
}

/// Outer encrypted packet as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    pub seq: u32,
    pub tag: [u8; TAG_LEN],
    pub payload: Vec<u8>,
}

impl EncryptedPacket {
    /// Value of the `len` header field for this packet, or `TooLarge` when the
    /// payload cannot be described by a 16-bit length.
    pub fn len_field(&self) -> Result<u16, CodecError> {
        u16::try_from(ENVELOPE_OVERHEAD + self.payload.len())
            .map_err(|_| CodecError::TooLarge(self.payload.len()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let len = self.len_field()?;
        let mut out =
            Vec::with_capacity(ENVELOPE_HEADER_LEN + ENVELOPE_OVERHEAD + self.payload.len());
        out.extend_from_slice(&ENVELOPE_TYPE.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses one datagram. Length checks run before any cryptography.
    pub fn parse(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < ENVELOPE_HEADER_LEN {
            return Err(CodecError::Malformed("datagram shorter than envelope header"));
        }
        let kind = u16::from_le_bytes([datagram[0], datagram[1]]);
        if kind != ENVELOPE_TYPE {
            return Err(CodecError::Malformed("unexpected envelope type"));
        }
        let len = u16::from_le_bytes([datagram[2], datagram[3]]) as usize;
        if len < ENVELOPE_OVERHEAD {
            return Err(CodecError::Malformed("length smaller than seq and tag"));
        }
        let body = &datagram[ENVELOPE_HEADER_LEN..];
        if len > body.len() {
            return Err(CodecError::Malformed("length exceeds datagram"));
        }
        if len < body.len() {
            return Err(CodecError::Malformed("trailing bytes after envelope"));
        }

        let seq = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&body[4..ENVELOPE_OVERHEAD]);
        Ok(Self {
            seq,
            tag,
            payload: body[ENVELOPE_OVERHEAD..].to_vec(),
        })
    }
}

/// Plaintext control message carried inside an envelope.
///
/// `msg_type` stays a raw tag here; mapping it onto a known kind is the
/// registry's job so that unknown kinds can be dropped without touching the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub msg_type: u16,
    pub body: Vec<u8>,
}

impl DecryptedMessage {
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self { msg_type, body }
    }

    pub fn size(&self) -> u16 {
        self.body.len() as u16
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        if self.body.len() > MAX_PLAINTEXT_LEN - MESSAGE_HEADER_LEN {
            return Err(CodecError::TooLarge(self.body.len() + MESSAGE_HEADER_LEN));
        }
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Parses decrypted plaintext. Bytes past `size` are ignored.
    pub fn parse(plaintext: &[u8]) -> Result<Self, CodecError> {
        if plaintext.len() < MESSAGE_HEADER_LEN {
            return Err(CodecError::Malformed("plaintext shorter than message header"));
        }
        let msg_type = u16::from_le_bytes([plaintext[0], plaintext[1]]);
        let size = u16::from_le_bytes([plaintext[2], plaintext[3]]) as usize;
        let body = &plaintext[MESSAGE_HEADER_LEN..];
        if size > body.len() {
            return Err(CodecError::Malformed("message size exceeds plaintext"));
        }
        Ok(Self {
            msg_type,
            body: body[..size].to_vec(),
        })
    }
}

/// Encrypts `message` under `seq`. The caller owns sequence allocation.
pub fn seal(
    cipher: &PacketCipher,
    direction: Direction,
    seq: u32,
    message: &DecryptedMessage,
) -> Result<EncryptedPacket, CodecError> {
    let mut payload = message.to_bytes()?;
    let tag = cipher
        .seal(seq, direction, &mut payload)
        .map_err(|_| CodecError::TooLarge(payload.len()))?;
    Ok(EncryptedPacket { seq, tag, payload })
}

/// Authenticates and decrypts `packet`. No plaintext escapes on tag mismatch.
pub fn open(
    cipher: &PacketCipher,
    direction: Direction,
    packet: &EncryptedPacket,
) -> Result<DecryptedMessage, CodecError> {
    let mut plaintext = packet.payload.clone();
    cipher
        .open(packet.seq, direction, &mut plaintext, &packet.tag)
        .map_err(|_| CodecError::AuthenticationFailed)?;
    DecryptedMessage::parse(&plaintext)
}
