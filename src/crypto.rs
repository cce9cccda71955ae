//! AES-GCM key material and per-packet IV derivation for control envelopes.
//!
//! Keys and the base IV arrive from the pairing/launch exchange; this module never
//! generates or persists them. Every packet is sealed under a 16-byte IV derived
//! from the base IV, the packet's sequence number and the direction of travel, so
//! the two directions of one session never share a nonce even though they share a
//! key.

use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type ControlCipher = AesGcm<Aes128, U16>;

/// Which way a packet travels; mixed into the IV as a two-byte marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl Direction {
    fn marker(self) -> [u8; 2] {
        match self {
            Direction::ClientToHost => *b"CC",
            Direction::HostToClient => *b"HC",
        }
    }
}

/// Symmetric key material negotiated out of band for one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    key: [u8; KEY_LEN],
    iv_base: [u8; IV_LEN],
}

impl SessionKeys {
    pub fn new(key: [u8; KEY_LEN], iv_base: [u8; IV_LEN]) -> Self {
        Self { key, iv_base }
    }

    /// Builds key material from raw slices, e.g. hex-decoded launch parameters.
    pub fn from_slices(key: &[u8], iv_base: &[u8]) -> Result<Self, KeyMaterialError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| KeyMaterialError::KeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        let iv_base: [u8; IV_LEN] =
            iv_base
                .try_into()
                .map_err(|_| KeyMaterialError::IvLength {
                    expected: IV_LEN,
                    actual: iv_base.len(),
                })?;
        Ok(Self { key, iv_base })
    }

    /// Derives the IV for `seq` travelling in `direction`.
    ///
    /// The sequence number is XORed little-endian into bytes `0..4` and the
    /// direction marker into bytes `10..12`, the layout Moonlight-family hosts use
    /// for encrypted control streams. An all-zero base therefore yields
    /// `seq LE || 6 zero bytes || marker || 4 zero bytes`.
    pub fn iv_for(&self, seq: u32, direction: Direction) -> [u8; IV_LEN] {
        let mut iv = self.iv_base;
        for (slot, byte) in iv[0..4].iter_mut().zip(seq.to_le_bytes()) {
            *slot ^= byte;
        }
        for (slot, byte) in iv[10..12].iter_mut().zip(direction.marker()) {
            *slot ^= byte;
        }
        iv
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv_base", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyMaterialError {
    #[error("aes key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
    #[error("aes iv must be {expected} bytes, got {actual}")]
    IvLength { expected: usize, actual: usize },
}

/// AES-128-GCM sealer/opener bound to one session's key material.
pub struct PacketCipher {
    cipher: ControlCipher,
    keys: SessionKeys,
}

impl PacketCipher {
    pub fn new(keys: SessionKeys) -> Self {
        let cipher = ControlCipher::new(GenericArray::from_slice(&keys.key));
        Self { cipher, keys }
    }

    /// Encrypts `buf` in place and returns the detached tag.
    pub fn seal(
        &self,
        seq: u32,
        direction: Direction,
        buf: &mut [u8],
    ) -> Result<[u8; TAG_LEN], aes_gcm::Error> {
        let iv = self.keys.iv_for(seq, direction);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], buf)?;
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verifies `tag` and decrypts `buf` in place. On failure `buf` must be discarded.
    pub fn open(
        &self,
        seq: u32,
        direction: Direction,
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), aes_gcm::Error> {
        let iv = self.keys.iv_for(seq, direction);
        self.cipher.decrypt_in_place_detached(
            GenericArray::from_slice(&iv),
            &[],
            buf,
            GenericArray::from_slice(tag),
        )
    }
}

impl fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCipher").finish_non_exhaustive()
    }
}
