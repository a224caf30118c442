//! Minimal hex codec for the fixed-size key material client configs carry
//! alongside their handshake token.

use crate::error::{Error, ErrorKind, Result};

pub fn encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N]> {
    if s.len() != N * 2 {
        return Err(Error::simple(ErrorKind::Config));
    }
    let mut out = [0u8; N];
    for i in 0..N {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::simple(ErrorKind::Config))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let s = encode(&data);
        assert_eq!(s, "deadbeef");
        let decoded: [u8; 4] = decode_fixed(&s).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(decode_fixed::<4>("ab").is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(decode_fixed::<2>("zzzz").is_err());
    }
}
