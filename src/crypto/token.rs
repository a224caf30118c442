//! Handshake token format (spec.md §4.5/§6).
//!
//! A trusted external issuer mints these tokens out-of-band (minting itself
//! is explicitly out of scope, spec.md §1); this module only knows how to
//! read one. The wire format is authenticated and encrypted with
//! [`fernet`](https://docs.rs/fernet), the same AES-128-CBC + HMAC-SHA256
//! construction as Python's `cryptography.fernet`, which real SniTun
//! deployments use for exactly this purpose.
//!
//! Plaintext layout, all integers big-endian:
//!
//! ```text
//! challenge:      [u8; 32]
//! identity:       [u8; 32]
//! valid_until:    u64
//! hostname_count: u8
//! hostnames:      (u8 len, UTF-8 bytes){hostname_count}
//! aes_key:        [u8; 32]
//! aes_iv:         [u8; 16]
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fernet::Fernet;
use std::io::{Cursor, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, ErrorKind, Result, ResultSimpleExt};

/// Largest number of hostnames a single token may carry.
pub const MAX_HOSTNAMES: usize = 255;

/// The decoded payload of a handshake token.
#[derive(Debug, Clone)]
pub struct HandshakeToken {
    pub challenge: [u8; 32],
    pub identity: [u8; 32],
    pub valid_until: u64,
    pub hostnames: Vec<String>,
    pub aes_key: [u8; 32],
    pub aes_iv: [u8; 16],
}

impl HandshakeToken {
    /// Serializes the plaintext payload (before Fernet encryption).
    fn to_plaintext(&self) -> Result<Vec<u8>> {
        if self.hostnames.len() > MAX_HOSTNAMES {
            return Err(Error::simple(ErrorKind::Config));
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.challenge);
        buf.extend_from_slice(&self.identity);
        buf.write_u64::<BigEndian>(self.valid_until)
            .expect("writing to a Vec never fails");
        buf.write_u8(self.hostnames.len() as u8)
            .expect("writing to a Vec never fails");
        for hostname in &self.hostnames {
            if hostname.len() > u8::MAX as usize {
                return Err(Error::simple(ErrorKind::Config));
            }
            buf.write_u8(hostname.len() as u8)
                .expect("writing to a Vec never fails");
            buf.extend_from_slice(hostname.as_bytes());
        }
        buf.extend_from_slice(&self.aes_key);
        buf.extend_from_slice(&self.aes_iv);
        Ok(buf)
    }

    /// Parses the plaintext payload produced by [`Self::to_plaintext`].
    fn from_plaintext(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut challenge = [0u8; 32];
        cursor
            .read_exact(&mut challenge)
            .simple(ErrorKind::Authentication)?;
        let mut identity = [0u8; 32];
        cursor
            .read_exact(&mut identity)
            .simple(ErrorKind::Authentication)?;
        let valid_until = cursor
            .read_u64::<BigEndian>()
            .simple(ErrorKind::Authentication)?;
        let count = cursor.read_u8().simple(ErrorKind::Authentication)? as usize;
        let mut hostnames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.read_u8().simple(ErrorKind::Authentication)? as usize;
            let mut raw = vec![0u8; len];
            cursor
                .read_exact(&mut raw)
                .simple(ErrorKind::Authentication)?;
            let hostname = String::from_utf8(raw).simple(ErrorKind::Authentication)?;
            hostnames.push(hostname);
        }
        let mut aes_key = [0u8; 32];
        cursor
            .read_exact(&mut aes_key)
            .simple(ErrorKind::Authentication)?;
        let mut aes_iv = [0u8; 16];
        cursor
            .read_exact(&mut aes_iv)
            .simple(ErrorKind::Authentication)?;

        Ok(HandshakeToken {
            challenge,
            identity,
            valid_until,
            hostnames,
            aes_key,
            aes_iv,
        })
    }

    /// Encrypts this token with the issuer's pre-shared `Fernet` key.
    pub fn issue(&self, fernet: &Fernet) -> Result<String> {
        let plaintext = self.to_plaintext()?;
        Ok(fernet.encrypt(&plaintext))
    }

    /// Validates and decodes a token produced by [`Self::issue`].
    ///
    /// Checks the Fernet signature, then enforces spec.md invariant 5: a
    /// token whose `valid_until` is less than *or equal to* now is rejected.
    pub fn validate(token: &str, fernet: &Fernet) -> Result<Self> {
        let plaintext = fernet
            .decrypt(token)
            .simple(ErrorKind::Authentication)?;
        let decoded = Self::from_plaintext(&plaintext)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs();
        if decoded.valid_until <= now {
            return Err(Error::simple(ErrorKind::Authentication));
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fernet() -> Fernet {
        Fernet::new(&Fernet::generate_key()).unwrap()
    }

    fn sample(valid_until: u64) -> HandshakeToken {
        HandshakeToken {
            challenge: [1u8; 32],
            identity: [2u8; 32],
            valid_until,
            hostnames: vec!["example.com".into(), "api.example.com".into()],
            aes_key: [3u8; 32],
            aes_iv: [4u8; 16],
        }
    }

    #[test]
    fn roundtrip() {
        let fernet = fernet();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = sample(now + 3600).issue(&fernet).unwrap();
        let decoded = HandshakeToken::validate(&token, &fernet).unwrap();
        assert_eq!(decoded.hostnames, vec!["example.com", "api.example.com"]);
        assert_eq!(decoded.aes_key, [3u8; 32]);
        assert_eq!(decoded.aes_iv, [4u8; 16]);
        assert_eq!(decoded.challenge, [1u8; 32]);
    }

    #[test]
    fn expired_token_rejected() {
        let fernet = fernet();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = sample(now - 1).issue(&fernet).unwrap();
        let err = HandshakeToken::validate(&token, &fernet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn valid_until_equal_to_now_is_rejected() {
        let fernet = fernet();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = sample(now).issue(&fernet).unwrap();
        let err = HandshakeToken::validate(&token, &fernet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn wrong_key_rejected() {
        let fernet = fernet();
        let other = Fernet::new(&Fernet::generate_key()).unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = sample(now + 3600).issue(&fernet).unwrap();
        let err = HandshakeToken::validate(&token, &other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
