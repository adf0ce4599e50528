//! Upload frame codec.
//!
//! One protocol message ("frame") is sent per connection, in this fixed
//! order on the wire:
//!
//! 1. nonce, 16 bytes
//! 2. authentication tag, 16 bytes
//! 3. UID, 32 bytes of UTF-8 padded with trailing zero bytes
//! 4. payload size, big-endian u32
//! 5. payload (ciphertext), exactly `size` bytes
//!
//! There is no version byte and no length framing beyond the payload size
//! field; both ends must agree on this layout exactly. A peer that closes
//! before the full payload arrived is a terminal transport error for that
//! connection, never a retry condition.

use std::io::Read;

use anyhow::{anyhow, Context, Result};

/// Nonce field width on the wire.
pub const NONCE_LEN: usize = 16;
/// Authentication tag field width on the wire.
pub const TAG_LEN: usize = 16;
/// UID field width on the wire (null-padded UTF-8).
pub const UID_FIELD_LEN: usize = 32;

/// One decoded protocol message. The payload is still ciphertext.
#[derive(Clone, Debug)]
pub struct Frame {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub uid: String,
    pub payload: Vec<u8>,
}

/// Encode a frame into the exact byte sequence to send.
///
/// UIDs longer than 32 bytes are truncated; shorter UIDs are padded with
/// zero bytes as the receiver trims trailing zeros before decoding.
pub fn encode_frame(
    uid: &str,
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut uid_field = [0u8; UID_FIELD_LEN];
    let uid_bytes = uid.as_bytes();
    let take = uid_bytes.len().min(UID_FIELD_LEN);
    uid_field[..take].copy_from_slice(&uid_bytes[..take]);

    let mut out =
        Vec::with_capacity(NONCE_LEN + TAG_LEN + UID_FIELD_LEN + 4 + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(&uid_field);
    out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Decode one frame with five sequential blocking reads.
///
/// `patch_size` bounds each payload read so a large upload never demands a
/// single oversized buffer fill from the transport.
pub fn decode_frame(reader: &mut impl Read, patch_size: usize) -> Result<Frame> {
    let mut nonce = [0u8; NONCE_LEN];
    reader
        .read_exact(&mut nonce)
        .context("short read on frame nonce")?;

    let mut tag = [0u8; TAG_LEN];
    reader
        .read_exact(&mut tag)
        .context("short read on frame tag")?;

    let mut uid_field = [0u8; UID_FIELD_LEN];
    reader
        .read_exact(&mut uid_field)
        .context("short read on frame uid")?;
    let trimmed: &[u8] = match uid_field.iter().rposition(|b| *b != 0) {
        Some(last) => &uid_field[..=last],
        None => &[],
    };
    let uid = std::str::from_utf8(trimmed)
        .map_err(|_| anyhow!("frame uid is not valid utf-8"))?
        .to_string();

    let mut size_field = [0u8; 4];
    reader
        .read_exact(&mut size_field)
        .context("short read on payload size")?;
    let payload_size = u32::from_be_bytes(size_field) as usize;

    let payload = read_payload(reader, payload_size, patch_size)
        .with_context(|| format!("reading {} payload bytes for uid '{}'", payload_size, uid))?;

    Ok(Frame {
        nonce,
        tag,
        uid,
        payload,
    })
}

/// Read exactly `payload_size` bytes in chunks of at most `patch_size`.
fn read_payload(reader: &mut impl Read, payload_size: usize, patch_size: usize) -> Result<Vec<u8>> {
    let patch_size = patch_size.max(1);
    let mut payload = Vec::with_capacity(payload_size);
    let mut chunk = vec![0u8; patch_size];
    while payload.len() < payload_size {
        let want = (payload_size - payload.len()).min(patch_size);
        let got = reader.read(&mut chunk[..want])?;
        if got == 0 {
            return Err(anyhow!(
                "peer closed after {} of {} payload bytes",
                payload.len(),
                payload_size
            ));
        }
        payload.extend_from_slice(&chunk[..got]);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_uid_lengths_up_to_field_width() {
        let nonce = [7u8; NONCE_LEN];
        let tag = [9u8; TAG_LEN];
        let payload = b"ciphertext bytes";
        for len in 1..=UID_FIELD_LEN {
            let uid: String = "U".repeat(len);
            let bytes = encode_frame(&uid, &nonce, &tag, payload);
            let frame = decode_frame(&mut Cursor::new(bytes), 1024).expect("decode");
            assert_eq!(frame.uid, uid);
            assert_eq!(frame.nonce, nonce);
            assert_eq!(frame.tag, tag);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn truncates_oversized_uid_on_encode() {
        let uid = "X".repeat(UID_FIELD_LEN + 9);
        let bytes = encode_frame(&uid, &[0; NONCE_LEN], &[0; TAG_LEN], b"p");
        let frame = decode_frame(&mut Cursor::new(bytes), 8).expect("decode");
        assert_eq!(frame.uid.len(), UID_FIELD_LEN);
        assert_eq!(frame.uid, "X".repeat(UID_FIELD_LEN));
    }

    #[test]
    fn decodes_payload_with_small_patch_size() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let bytes = encode_frame("AAFL-000007-CAFAF", &[1; NONCE_LEN], &[2; TAG_LEN], &payload);
        let frame = decode_frame(&mut Cursor::new(bytes), 33).expect("decode");
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn short_payload_is_a_transport_error() {
        let mut bytes = encode_frame("AAFL-000007-CAFAF", &[1; NONCE_LEN], &[2; TAG_LEN], &[5u8; 100]);
        bytes.truncate(bytes.len() - 40);
        let err = decode_frame(&mut Cursor::new(bytes), 16).expect_err("must fail");
        assert!(format!("{:#}", err).contains("peer closed"));
    }

    #[test]
    fn truncated_header_is_a_transport_error() {
        let bytes = vec![0u8; NONCE_LEN + TAG_LEN + 5];
        assert!(decode_frame(&mut Cursor::new(bytes), 16).is_err());
    }

    #[test]
    fn rejects_non_utf8_uid() {
        let mut bytes = encode_frame("AAFL-000007-CAFAF", &[0; NONCE_LEN], &[0; TAG_LEN], b"");
        bytes[NONCE_LEN + TAG_LEN] = 0xff;
        bytes[NONCE_LEN + TAG_LEN + 1] = 0xfe;
        assert!(decode_frame(&mut Cursor::new(bytes), 16).is_err());
    }

    #[test]
    fn empty_payload_round_trips() {
        let bytes = encode_frame("AAYL-000021-CAFAF", &[3; NONCE_LEN], &[4; TAG_LEN], b"");
        let frame = decode_frame(&mut Cursor::new(bytes), 16).expect("decode");
        assert!(frame.payload.is_empty());
    }
}
