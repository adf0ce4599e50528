//! Payload encryption envelope.
//!
//! Uploads are protected with AES-256-GCM under a pre-shared 32-byte key
//! known to both the probe and the station; nothing is negotiated on the
//! wire. The nonce is 16 bytes to match the frame layout, generated fresh
//! per message, and the 16-byte tag travels detached next to it.
//!
//! Verification failure is NOT a session error: the station logs it,
//! treats the payload as empty and carries on, so downstream consumers
//! must tolerate zero-byte decoded payloads.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce, Tag};
use anyhow::{anyhow, Result};
use rand::RngCore;
use zeroize::Zeroize;

use crate::wire::{NONCE_LEN, TAG_LEN};

/// AES-256-GCM with the 16-byte nonce the wire format carries.
type PayloadCipher = AesGcm<Aes256, U16>;

/// Pre-shared key width.
pub const KEY_LEN: usize = 32;

/// An encrypted payload with its detached authentication material.
#[derive(Clone, Debug)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload under the shared key with a fresh random nonce.
pub fn seal(key: &[u8; KEY_LEN], payload: &[u8]) -> Result<Sealed> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = PayloadCipher::new(Key::<PayloadCipher>::from_slice(key));
    let mut ciphertext = payload.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), &[], &mut ciphertext)
        .map_err(|_| anyhow!("payload encryption failed"))?;

    Ok(Sealed {
        nonce,
        tag: tag.into(),
        ciphertext,
    })
}

/// Decrypt and verify a received payload.
///
/// Any tampering with nonce, tag or ciphertext fails verification.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = PayloadCipher::new(Key::<PayloadCipher>::from_slice(key));
    let mut clear = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(nonce),
            &[],
            &mut clear,
            Tag::from_slice(tag),
        )
        .map_err(|_| anyhow!("payload authentication failed"))?;
    Ok(clear)
}

/// Parse the shared key from its configured form.
///
/// Accepts 64 hex characters or a raw 32-byte string. Intermediate copies
/// of key material are wiped.
pub fn key_from_config(value: &str) -> Result<[u8; KEY_LEN]> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("shared key is required"));
    }

    if trimmed.len() == KEY_LEN * 2 {
        if let Ok(mut decoded) = hex::decode(trimmed) {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&decoded);
            decoded.zeroize();
            return Ok(key);
        }
    }

    if trimmed.len() == KEY_LEN {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(trimmed.as_bytes());
        return Ok(key);
    }

    Err(anyhow!(
        "shared key must be 64 hex characters or exactly {} bytes, got {} bytes",
        KEY_LEN,
        trimmed.len()
    ))
}
