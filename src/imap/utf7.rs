//! Modified UTF-7 mailbox name encoding (RFC 3501 §5.1.3).
//!
//! ASCII 0x20..0x7e is carried literally except `&`, which opens a base64 run
//! over the big-endian UTF-16 code units of the escaped text, closed by `-`.
//! The base64 alphabet is the mailbox-safe variant (`,` instead of `/`), no
//! padding. `&-` is the escape for a literal `&`.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;
use lazy_static::lazy_static;
use thiserror::Error;

lazy_static! {
    static ref B64: GeneralPurpose = GeneralPurpose::new(
        &Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+,")
            .expect("fixed alphabet"),
        GeneralPurposeConfig::new()
            .with_encode_padding(false)
            .with_decode_padding_mode(DecodePaddingMode::RequireNone)
            .with_decode_allow_trailing_bits(true),
    );
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Utf7Error {
    #[error("unterminated &-escape in mailbox name")]
    Unterminated,
    #[error("invalid base64 in mailbox name")]
    BadBase64,
    #[error("escape does not decode to UTF-16")]
    BadUtf16,
    #[error("mailbox name contains non-ASCII byte 0x{0:02x}")]
    NonAscii(u8),
}

/// Decode a wire-form mailbox name. `INBOX` in any case is canonicalized to
/// uppercase before this is called; see [`decode_mailbox_name`].
pub fn decode(raw: &[u8]) -> Result<String, Utf7Error> {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b > 0x7e {
            return Err(Utf7Error::NonAscii(b));
        }
        if b != b'&' {
            out.push(b as char);
            i += 1;
            continue;
        }
        let end = raw[i + 1..]
            .iter()
            .position(|&c| c == b'-')
            .map(|p| i + 1 + p)
            .ok_or(Utf7Error::Unterminated)?;
        if end == i + 1 {
            out.push('&');
        } else {
            let bytes = B64
                .decode(&raw[i + 1..end])
                .map_err(|_| Utf7Error::BadBase64)?;
            if bytes.len() % 2 != 0 {
                return Err(Utf7Error::BadUtf16);
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            out.push_str(&String::from_utf16(&units).map_err(|_| Utf7Error::BadUtf16)?);
        }
        i = end + 1;
    }
    Ok(out)
}

/// Encode a mailbox name for the wire.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut run: Vec<u16> = Vec::new();
    let flush = |out: &mut String, run: &mut Vec<u16>| {
        if run.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(run.len() * 2);
        for u in run.iter() {
            bytes.extend_from_slice(&u.to_be_bytes());
        }
        out.push('&');
        out.push_str(&B64.encode(&bytes));
        out.push('-');
        run.clear();
    };
    for c in name.chars() {
        if (' '..='~').contains(&c) {
            flush(&mut out, &mut run);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut buf = [0u16; 2];
            run.extend_from_slice(c.encode_utf16(&mut buf));
        }
    }
    flush(&mut out, &mut run);
    out
}

/// Decode a mailbox-name slot: the five bytes `INBOX` are matched
/// case-insensitively and canonicalized, everything else is Modified UTF-7.
pub fn decode_mailbox_name(raw: &[u8]) -> Result<String, Utf7Error> {
    if raw.eq_ignore_ascii_case(b"INBOX") {
        return Ok("INBOX".to_string());
    }
    decode(raw)
}

/// Encode a mailbox name for output; names that survive encoding unchanged
/// are common, so this only allocates on the escape path.
pub fn encode_mailbox_name(name: &str) -> String {
    if name.is_ascii() && !name.contains('&') {
        name.to_string()
    } else {
        encode(name)
    }
}
