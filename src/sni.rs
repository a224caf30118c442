//! SNI extraction from a raw TLS ClientHello (spec.md §2, "accept a TCP
//! connection and peek its SNI without terminating TLS").
//!
//! This never completes or even touches the TLS handshake; it just reads
//! enough of the first flight to parse the `server_name` extension out of a
//! `ClientHello`, following RFC 8446 §4.1.2's record/handshake framing.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, ErrorKind, Result, ResultSimpleExt};
use crate::frame::MAX_SNI_LEN;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

/// Parses the SNI hostname out of a buffer holding (at least) a complete
/// TLS record carrying a ClientHello. Returns [`ErrorKind::SniParse`] if the
/// buffer is malformed, incomplete, or the extension is absent.
pub fn parse_sni(buf: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(buf);

    let record_type = cursor.read_u8().simple(ErrorKind::SniParse)?;
    if record_type != RECORD_HANDSHAKE {
        return Err(Error::simple(ErrorKind::SniParse));
    }
    let _legacy_version = cursor.read_u16::<BigEndian>().simple(ErrorKind::SniParse)?;
    let record_len = cursor.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
    let mut record = vec![0u8; record_len];
    cursor.read_exact(&mut record).simple(ErrorKind::SniParse)?;

    let mut hs = Cursor::new(&record[..]);
    let hs_type = hs.read_u8().simple(ErrorKind::SniParse)?;
    if hs_type != HANDSHAKE_CLIENT_HELLO {
        return Err(Error::simple(ErrorKind::SniParse));
    }
    let hs_len = read_u24(&mut hs)?;
    let mut body = vec![0u8; hs_len];
    hs.read_exact(&mut body).simple(ErrorKind::SniParse)?;
    let mut body = Cursor::new(&body[..]);

    // legacy_version(2) + random(32)
    skip(&mut body, 2 + 32)?;
    // legacy_session_id
    let session_id_len = body.read_u8().simple(ErrorKind::SniParse)? as usize;
    skip(&mut body, session_id_len)?;
    // cipher_suites
    let cipher_suites_len = body.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
    skip(&mut body, cipher_suites_len)?;
    // legacy_compression_methods
    let compression_len = body.read_u8().simple(ErrorKind::SniParse)? as usize;
    skip(&mut body, compression_len)?;

    // extensions are optional on the wire grammar, but absent extensions
    // means no SNI at all
    let extensions_len = body.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
    let mut extensions = vec![0u8; extensions_len];
    body.read_exact(&mut extensions).simple(ErrorKind::SniParse)?;
    let mut extensions = Cursor::new(&extensions[..]);

    while (extensions.position() as usize) < extensions_len {
        let ext_type = extensions.read_u16::<BigEndian>().simple(ErrorKind::SniParse)?;
        let ext_len = extensions.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
        let mut ext_data = vec![0u8; ext_len];
        extensions
            .read_exact(&mut ext_data)
            .simple(ErrorKind::SniParse)?;

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_list(&ext_data);
        }
    }

    Err(Error::simple(ErrorKind::SniParse))
}

fn parse_server_name_list(data: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(data);
    let list_len = cursor.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
    let mut list = vec![0u8; list_len];
    cursor.read_exact(&mut list).simple(ErrorKind::SniParse)?;
    let mut list = Cursor::new(&list[..]);

    while (list.position() as usize) < list_len {
        let name_type = list.read_u8().simple(ErrorKind::SniParse)?;
        let name_len = list.read_u16::<BigEndian>().simple(ErrorKind::SniParse)? as usize;
        let mut name = vec![0u8; name_len];
        list.read_exact(&mut name).simple(ErrorKind::SniParse)?;

        if name_type == SNI_HOST_NAME {
            if name.len() > MAX_SNI_LEN {
                return Err(Error::simple(ErrorKind::SniParse));
            }
            return String::from_utf8(name).simple(ErrorKind::SniParse);
        }
    }

    Err(Error::simple(ErrorKind::SniParse))
}

fn read_u24<R: Read>(r: &mut R) -> Result<usize> {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf).simple(ErrorKind::SniParse)?;
    Ok(((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize)
}

fn skip<R: Read>(r: &mut R, n: usize) -> Result<()> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).simple(ErrorKind::SniParse)
}
