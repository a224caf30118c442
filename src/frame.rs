//! Wire frame format for the multiplexer.
//!
//! Every frame shares a fixed 32-byte plaintext header (channel id, frame
//! type, payload length, and a type-dependent extra field), encrypted with
//! the peer's AES-256-CBC key/IV, followed by the encrypted, PKCS#7-padded
//! payload. See spec.md §3/§4.1/§6.
//!
//! # Header layout (32 bytes, all integers big-endian)
//! ```text
//! +----------------+------+--------+-------------+
//! | channel_id(16) | type | len(4) | extra(11)   |
//! +----------------+------+--------+-------------+
//! ```
//! The header always encrypts to exactly two AES blocks (no padding is
//! needed since 32 is already block-aligned); the payload is padded
//! separately with PKCS#7.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::crypto::cipher::PeerCrypto;
use crate::error::{Error, ErrorKind, Result, ResultSimpleExt};

/// Size of the channel id, in bytes.
pub const CHANNEL_ID_LEN: usize = 16;
/// Size of the type-dependent extra field, in bytes.
pub const EXTRA_LEN: usize = 11;
/// Size of the plaintext header, in bytes.
pub const HEADER_LEN: usize = CHANNEL_ID_LEN + 1 + 4 + EXTRA_LEN;
/// Largest payload a single frame may carry.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;
/// Largest payload a single DATA frame should carry; larger writes are
/// fragmented by the multiplexer writer task.
pub const MAX_DATA: usize = 4 * 1024;
/// Largest SNI hostname carried in a NEW frame's extra field.
pub const MAX_SNI_LEN: usize = 256;

const AES_BLOCK: usize = 16;

/// 16-byte identifier of a multiplexer channel, unique within a peer session.
pub type ChannelId = [u8; CHANNEL_ID_LEN];

/// The type tag of a [`Frame`], per spec.md §3.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a channel. Payload carries the UTF-8 SNI hostname.
    New = 0x01,
    /// Opaque payload bytes for the channel.
    Data = 0x02,
    /// Half-close the channel from the sender's side.
    Close = 0x04,
    /// Liveness probe; extra carries an 11-byte caller-chosen tag.
    Ping = 0x08,
    /// Ask the remote to stop writing on the channel.
    Pause = 0x16,
    /// Ask the remote to resume writing on the channel.
    Resume = 0x17,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => FrameType::New,
            0x02 => FrameType::Data,
            0x04 => FrameType::Close,
            0x08 => FrameType::Ping,
            0x16 => FrameType::Pause,
            0x17 => FrameType::Resume,
            _ => return None,
        })
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel_id: ChannelId,
    pub frame_type: FrameType,
    pub extra: [u8; EXTRA_LEN],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encodes this frame, encrypting header and payload with `crypto`.
    pub fn encode(&self, crypto: &PeerCrypto) -> Result<Vec<u8>> {
        encode(
            self.channel_id,
            self.frame_type,
            self.extra,
            &self.payload,
            crypto,
        )
    }
}

/// Encodes a frame from its parts, encrypting header and payload with
/// `crypto`. Symmetric with [`decode`].
pub fn encode(
    channel_id: ChannelId,
    frame_type: FrameType,
    extra: [u8; EXTRA_LEN],
    payload: &[u8],
    crypto: &PeerCrypto,
) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME {
        return Err(Error::simple(ErrorKind::Protocol));
    }

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&channel_id);
    header
        .write_u8(frame_type as u8)
        .expect("writing to a Vec never fails");
    header
        .write_u32::<BigEndian>(payload.len() as u32)
        .expect("writing to a Vec never fails");
    header.extend_from_slice(&extra);
    debug_assert_eq!(header.len(), HEADER_LEN);

    let header_ct = crypto.encrypt_no_pad(&header);
    let payload_ct = crypto.encrypt_pkcs7(payload);

    let mut out = Vec::with_capacity(header_ct.len() + payload_ct.len());
    out.extend_from_slice(&header_ct);
    out.extend_from_slice(&payload_ct);
    Ok(out)
}

/// The three fields decoded straight out of the plaintext header, before the
/// payload ciphertext has even been read off the wire.
struct DecodedHeader {
    channel_id: ChannelId,
    frame_type: FrameType,
    length: usize,
    extra: [u8; EXTRA_LEN],
}

fn decode_header(header_pt: &[u8]) -> Result<DecodedHeader> {
    let mut cursor = io::Cursor::new(header_pt);
    let mut channel_id = [0u8; CHANNEL_ID_LEN];
    cursor
        .read_exact(&mut channel_id)
        .simple(ErrorKind::Protocol)?;
    let raw_type = cursor.read_u8().simple(ErrorKind::Protocol)?;
    let length = cursor
        .read_u32::<BigEndian>()
        .simple(ErrorKind::Protocol)? as usize;
    let mut extra = [0u8; EXTRA_LEN];
    cursor.read_exact(&mut extra).simple(ErrorKind::Protocol)?;

    let frame_type =
        FrameType::from_u8(raw_type).ok_or_else(|| Error::simple(ErrorKind::Protocol))?;
    if length > MAX_FRAME {
        return Err(Error::simple(ErrorKind::Protocol));
    }

    Ok(DecodedHeader {
        channel_id,
        frame_type,
        length,
        extra,
    })
}

/// Reads and decodes exactly one frame from `stream`, decrypting with
/// `crypto`. Reads the 32-byte header ciphertext first, then however many
/// ciphertext bytes the decoded length demands.
pub fn decode<R: Read>(stream: &mut R, crypto: &PeerCrypto) -> Result<Frame> {
    let mut header_ct = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_ct).map_err(Error::from)?;
    let header_pt = crypto.decrypt_no_pad(&header_ct)?;
    let header = decode_header(&header_pt)?;

    let padded_len = pkcs7_padded_len(header.length);
    let mut payload_ct = vec![0u8; padded_len];
    stream.read_exact(&mut payload_ct).map_err(Error::from)?;
    let payload = crypto.decrypt_pkcs7(&payload_ct, header.length)?;

    Ok(Frame {
        channel_id: header.channel_id,
        frame_type: header.frame_type,
        extra: header.extra,
        payload,
    })
}

/// Async counterpart of [`decode`], for use on a Tokio socket.
pub async fn decode_async<R>(stream: &mut R, crypto: &PeerCrypto) -> Result<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header_ct = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_ct).await.map_err(Error::from)?;
    let header_pt = crypto.decrypt_no_pad(&header_ct)?;
    let header = decode_header(&header_pt)?;

    let padded_len = pkcs7_padded_len(header.length);
    let mut payload_ct = vec![0u8; padded_len];
    stream
        .read_exact(&mut payload_ct)
        .await
        .map_err(Error::from)?;
    let payload = crypto.decrypt_pkcs7(&payload_ct, header.length)?;

    Ok(Frame {
        channel_id: header.channel_id,
        frame_type: header.frame_type,
        extra: header.extra,
        payload,
    })
}

/// Ciphertext length for a PKCS#7-padded plaintext of `len` bytes.
pub fn pkcs7_padded_len(len: usize) -> usize {
    (len / AES_BLOCK + 1) * AES_BLOCK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::PeerCrypto;

    fn crypto() -> PeerCrypto {
        PeerCrypto::new([7u8; 32], [9u8; 16])
    }

    fn roundtrip(frame_type: FrameType, extra: [u8; EXTRA_LEN], payload: &[u8]) {
        let crypto = crypto();
        let channel_id = [3u8; CHANNEL_ID_LEN];
        let wire = encode(channel_id, frame_type, extra, payload, &crypto).unwrap();
        let mut cursor = io::Cursor::new(wire);
        let decoded = decode(&mut cursor, &crypto).unwrap();
        assert_eq!(decoded.channel_id, channel_id);
        assert_eq!(decoded.frame_type, frame_type);
        assert_eq!(decoded.extra, extra);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn data_frame_roundtrip() {
        roundtrip(FrameType::Data, [0u8; EXTRA_LEN], b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn empty_payload_roundtrip() {
        roundtrip(FrameType::Close, [0u8; EXTRA_LEN], b"");
    }

    #[test]
    fn block_aligned_payload_roundtrip() {
        roundtrip(FrameType::Data, [0u8; EXTRA_LEN], &[0x42; 32]);
    }

    #[test]
    fn ping_tag_echoed_in_extra() {
        let mut extra = [0u8; EXTRA_LEN];
        extra[0] = 1;
        extra[1..6].copy_from_slice(b"hello");
        roundtrip(FrameType::Ping, extra, b"");
    }

    #[test]
    fn unknown_frame_type_is_protocol_error() {
        let crypto = crypto();
        let channel_id = [1u8; CHANNEL_ID_LEN];
        let mut wire = encode(channel_id, FrameType::Data, [0u8; EXTRA_LEN], b"x", &crypto).unwrap();
        // corrupt the type byte inside the plaintext header, then re-encrypt
        let mut header = crypto.decrypt_no_pad(&wire[..HEADER_LEN]).unwrap();
        header[CHANNEL_ID_LEN] = 0xEE;
        let new_header_ct = crypto.encrypt_no_pad(&header);
        wire[..HEADER_LEN].copy_from_slice(&new_header_ct);

        let mut cursor = io::Cursor::new(wire);
        let err = decode(&mut cursor, &crypto).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let crypto = crypto();
        let err = encode(
            [0u8; CHANNEL_ID_LEN],
            FrameType::Data,
            [0u8; EXTRA_LEN],
            &vec![0u8; MAX_FRAME + 1],
            &crypto,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
