//! Per-peer AES-256-CBC frame encryption.
//!
//! Each [`Peer`](crate::peer::Peer) owns one key/IV pair, taken verbatim from
//! its handshake token (spec.md §3), used to encrypt and decrypt every frame
//! it exchanges with the multiplexer on the other end.

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding, block_padding::Pkcs7};

use crate::error::{Error, ErrorKind, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256 key material for one peer session.
#[derive(Clone)]
pub struct PeerCrypto {
    key: [u8; 32],
    iv: [u8; 16],
}

impl PeerCrypto {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        PeerCrypto { key, iv }
    }

    /// Encrypts `data`, which must already be a multiple of the AES block
    /// size (used for the fixed-size frame header).
    pub fn encrypt_no_pad(&self, data: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(data)
    }

    /// Decrypts a ciphertext produced by [`Self::encrypt_no_pad`].
    pub fn decrypt_no_pad(&self, data: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| Error::simple(ErrorKind::Protocol))
    }

    /// Encrypts `data` with PKCS#7 padding, as used for frame payloads.
    pub fn encrypt_pkcs7(&self, data: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// Decrypts a PKCS#7-padded ciphertext, returning exactly `plain_len`
    /// bytes. The caller already knows the plaintext length from the frame
    /// header, so padding bytes are discarded rather than validated.
    pub fn decrypt_pkcs7(&self, data: &[u8], plain_len: usize) -> Result<Vec<u8>> {
        let mut raw = Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| Error::simple(ErrorKind::Protocol))?;
        if plain_len > raw.len() {
            return Err(Error::simple(ErrorKind::Protocol));
        }
        raw.truncate(plain_len);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_no_pad() {
        let crypto = PeerCrypto::new([1u8; 32], [2u8; 16]);
        let header = [5u8; 32];
        let ct = crypto.encrypt_no_pad(&header);
        let pt = crypto.decrypt_no_pad(&ct).unwrap();
        assert_eq!(pt, header);
    }

    #[test]
    fn payload_roundtrip_pkcs7() {
        let crypto = PeerCrypto::new([3u8; 32], [4u8; 16]);
        let payload = b"hello tunnel world";
        let ct = crypto.encrypt_pkcs7(payload);
        let pt = crypto.decrypt_pkcs7(&ct, payload.len()).unwrap();
        assert_eq!(pt, payload);
    }

    #[test]
    fn payload_roundtrip_empty() {
        let crypto = PeerCrypto::new([3u8; 32], [4u8; 16]);
        let ct = crypto.encrypt_pkcs7(b"");
        let pt = crypto.decrypt_pkcs7(&ct, 0).unwrap();
        assert!(pt.is_empty());
    }
}
