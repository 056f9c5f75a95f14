//! Message rendering for FETCH: section slicing, ENVELOPE and BODYSTRUCTURE.
//!
//! The full MIME tree lives behind the store boundary; what FETCH needs from
//! raw RFC 822 bytes is sliced here. Multi-part messages are served whole or
//! by their first part; a backend with a real MIME layer can take over part
//! addressing without touching the protocol engine.

use chrono::{DateTime, Datelike, Utc};

use super::response::Line;
use super::types::{FetchItem, Section, SectionName};

/// Split raw message bytes into (header incl. the blank line, body).
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        (&raw[..pos + 4], &raw[pos + 4..])
    } else if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        (&raw[..pos + 2], &raw[pos + 2..])
    } else {
        (raw, &[])
    }
}

/// Unfolded value of a header field, or None when absent.
pub fn header_value(raw: &[u8], name: &str) -> Option<String> {
    let (header, _) = split_message(raw);
    let mut value: Option<Vec<u8>> = None;
    for line in header.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if value.is_some() {
            if line.starts_with(b" ") || line.starts_with(b"\t") {
                let v = value.as_mut().expect("checked above");
                v.push(b' ');
                v.extend_from_slice(trim_start(line));
                continue;
            }
            break;
        }
        if let Some(pos) = line.iter().position(|&b| b == b':') {
            if line[..pos].eq_ignore_ascii_case(name.as_bytes()) {
                value = Some(trim_start(&line[pos + 1..]).to_vec());
            }
        }
    }
    value.map(|v| String::from_utf8_lossy(&v).into_owned())
}

fn trim_start(b: &[u8]) -> &[u8] {
    let skip = b.iter().take_while(|&&c| c == b' ' || c == b'\t').count();
    &b[skip..]
}

/// Resolve a BODY[] section against raw message bytes.
pub fn section_bytes(raw: &[u8], section: &Section) -> Vec<u8> {
    let (header, body) = split_message(raw);
    // Part addressing: a single-part message exposes its content as part 1.
    let scoped: (&[u8], &[u8]) = match section.parts.as_slice() {
        [] => (header, body),
        [1] => (header, body),
        _ => (&[], &[]),
    };
    let part_scoped = !section.parts.is_empty();
    match section.name {
        SectionName::Full => {
            if part_scoped {
                scoped.1.to_vec()
            } else {
                raw.to_vec()
            }
        }
        SectionName::Text => scoped.1.to_vec(),
        SectionName::Header if part_scoped => Vec::new(),
        SectionName::Header => scoped.0.to_vec(),
        SectionName::Mime => scoped.0.to_vec(),
        SectionName::HeaderFields => filter_headers(scoped.0, &section.fields, false),
        SectionName::HeaderFieldsNot => filter_headers(scoped.0, &section.fields, true),
    }
}

/// Keep (or drop) the named header fields; the delimiting blank line stays.
fn filter_headers(header: &[u8], fields: &[String], invert: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut keeping = false;
    for line in header.split_inclusive(|&b| b == b'\n') {
        let bare = line.strip_suffix(b"\n").unwrap_or(line);
        let bare = bare.strip_suffix(b"\r").unwrap_or(bare);
        if bare.is_empty() {
            break;
        }
        if bare.starts_with(b" ") || bare.starts_with(b"\t") {
            if keeping {
                out.extend_from_slice(line);
            }
            continue;
        }
        let wanted = match bare.iter().position(|&b| b == b':') {
            Some(pos) => fields
                .iter()
                .any(|f| bare[..pos].eq_ignore_ascii_case(f.as_bytes())),
            None => false,
        };
        keeping = wanted != invert;
        if keeping {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Clamp a `<start.length>` partial against the encoded section size.
pub fn apply_partial(bytes: &[u8], partial: Option<(u32, u32)>) -> (Vec<u8>, Option<u32>) {
    match partial {
        None => (bytes.to_vec(), None),
        Some((start, len)) => {
            let start_idx = (start as usize).min(bytes.len());
            let end = start_idx.saturating_add(len as usize).min(bytes.len());
            (bytes[start_idx..end].to_vec(), Some(start))
        }
    }
}

/// RFC 3501 envelope: (date subject from sender reply-to to cc bcc
/// in-reply-to message-id), addresses as ((name adl mailbox host) ...).
pub fn envelope(raw: &[u8]) -> Vec<u8> {
    let from = address_list(raw, "From");
    let sender = non_nil_or(address_list(raw, "Sender"), &from);
    let reply_to = non_nil_or(address_list(raw, "Reply-To"), &from);
    let mut line = Line::fragment().raw("(");
    line = nstring_header(line, raw, "Date").sp();
    line = nstring_header(line, raw, "Subject").sp();
    line = line.bytes(&from).sp();
    line = line.bytes(&sender).sp();
    line = line.bytes(&reply_to).sp();
    line = line.bytes(&address_list(raw, "To")).sp();
    line = line.bytes(&address_list(raw, "Cc")).sp();
    line = line.bytes(&address_list(raw, "Bcc")).sp();
    line = nstring_header(line, raw, "In-Reply-To").sp();
    line = nstring_header(line, raw, "Message-ID");
    line.raw(")").into_bytes()
}

fn non_nil_or(v: Vec<u8>, fallback: &[u8]) -> Vec<u8> {
    if v == b"NIL" {
        fallback.to_vec()
    } else {
        v
    }
}

fn nstring_header(line: Line, raw: &[u8], name: &str) -> Line {
    match header_value(raw, name) {
        Some(v) => line.nstring(Some(v.as_bytes())),
        None => line.nstring(None),
    }
}

fn address_list(raw: &[u8], name: &str) -> Vec<u8> {
    let value = match header_value(raw, name) {
        Some(v) if !v.trim().is_empty() => v,
        _ => return b"NIL".to_vec(),
    };
    let mut line = Line::fragment().raw("(");
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, addr) = match (part.find('<'), part.find('>')) {
            (Some(lt), Some(gt)) if lt < gt => {
                let display = part[..lt].trim().trim_matches('"');
                (
                    if display.is_empty() {
                        None
                    } else {
                        Some(display.to_string())
                    },
                    part[lt + 1..gt].to_string(),
                )
            }
            _ => (None, part.to_string()),
        };
        let (mailbox, host) = match addr.split_once('@') {
            Some((m, h)) => (m.to_string(), Some(h.to_string())),
            None => (addr, None),
        };
        line = line.raw("(");
        line = line.nstring(name.as_deref().map(str::as_bytes)).sp();
        line = line.nstring(None).sp();
        line = line.nstring(Some(mailbox.as_bytes())).sp();
        line = line.nstring(host.as_deref().map(str::as_bytes));
        line = line.raw(")");
    }
    line.raw(")").into_bytes()
}

/// Single-part body structure from the Content-Type header; the basic form
/// for BODY, extended (with the four NIL extension slots) for BODYSTRUCTURE.
pub fn body_structure(raw: &[u8], extended: bool) -> Vec<u8> {
    let (media, subtype, charset) = content_type(raw);
    let (_, body) = split_message(raw);
    let lines = body.iter().filter(|&&b| b == b'\n').count();
    let encoding = header_value(raw, "Content-Transfer-Encoding")
        .map(|v| v.to_ascii_uppercase())
        .unwrap_or_else(|| "7BIT".to_string());
    let mut line = Line::fragment()
        .raw("(")
        .string(media.as_bytes())
        .sp()
        .string(subtype.as_bytes())
        .sp()
        .raw("(\"CHARSET\" ")
        .string(charset.as_bytes())
        .raw(") NIL NIL ")
        .string(encoding.as_bytes())
        .sp()
        .number(body.len() as u64);
    if media == "TEXT" {
        line = line.sp().number(lines as u64);
    }
    if extended {
        line = line.raw(" NIL NIL NIL NIL");
    }
    line.raw(")").into_bytes()
}

fn content_type(raw: &[u8]) -> (String, String, String) {
    let value = header_value(raw, "Content-Type")
        .unwrap_or_else(|| "text/plain; charset=us-ascii".to_string());
    let mut parts = value.splitn(2, ';');
    let mime = parts.next().unwrap_or("text/plain").trim();
    let mut mt = mime.splitn(2, '/');
    let media = mt.next().unwrap_or("text").trim().to_ascii_uppercase();
    let subtype = mt.next().unwrap_or("plain").trim().to_ascii_uppercase();
    let mut charset = "US-ASCII".to_string();
    if let Some(params) = parts.next() {
        for param in params.split(';') {
            if let Some((k, v)) = param.split_once('=') {
                if k.trim().eq_ignore_ascii_case("charset") {
                    charset = v.trim().trim_matches('"').to_ascii_uppercase();
                }
            }
        }
    }
    (media, subtype, charset)
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// INTERNALDATE wire form: `dd-MMM-yyyy HH:MM:SS +0000`, day space-padded.
pub fn internal_date_string(dt: &DateTime<Utc>) -> String {
    format!(
        "{:>2}-{}-{} {} +0000",
        dt.day(),
        MONTHS[dt.month0() as usize],
        dt.year(),
        dt.format("%H:%M:%S"),
    )
}

/// True when any requested item needs raw message content from the store.
pub fn items_need_body(items: &[FetchItem]) -> bool {
    items.iter().any(|i| {
        i.is_body()
            || matches!(
                i.item,
                super::types::FetchItemType::Envelope
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::types::FetchItemType;
    use chrono::TimeZone;

    const RAW: &[u8] = b"From: Alice Price <alice@example.tld>\r\nTo: bob@example.tld, Carol <carol@x.org>\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\nSubject: afternoon meeting\r\nMessage-ID: <B27397-0100000@cac.washington.edu>\r\n\r\nHello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    #[test]
    fn sections() {
        let s = section_bytes(RAW, &Section::default());
        assert_eq!(s, RAW);

        let s = section_bytes(
            RAW,
            &Section {
                parts: vec![],
                name: SectionName::Text,
                fields: vec![],
            },
        );
        assert!(s.starts_with(b"Hello Joe"));

        let s = section_bytes(
            RAW,
            &Section {
                parts: vec![],
                name: SectionName::Header,
                fields: vec![],
            },
        );
        assert!(s.ends_with(b"\r\n\r\n"));
        assert!(s.starts_with(b"From:"));
    }

    #[test]
    fn header_fields_filtering() {
        let s = section_bytes(
            RAW,
            &Section {
                parts: vec![],
                name: SectionName::HeaderFields,
                fields: vec!["subject".into(), "FROM".into()],
            },
        );
        let text = String::from_utf8(s).unwrap();
        assert!(text.contains("From: Alice"));
        assert!(text.contains("Subject: afternoon meeting"));
        assert!(!text.contains("To:"));
        assert!(text.ends_with("\r\n\r\n"));

        let s = section_bytes(
            RAW,
            &Section {
                parts: vec![],
                name: SectionName::HeaderFieldsNot,
                fields: vec!["subject".into()],
            },
        );
        let text = String::from_utf8(s).unwrap();
        assert!(text.contains("From: Alice"));
        assert!(!text.contains("Subject:"));
    }

    #[test]
    fn partial_clamps() {
        let (slice, origin) = apply_partial(b"abcdef", Some((2, 3)));
        assert_eq!(slice, b"cde");
        assert_eq!(origin, Some(2));
        let (slice, _) = apply_partial(b"abcdef", Some((4, 100)));
        assert_eq!(slice, b"ef");
        let (slice, _) = apply_partial(b"abcdef", Some((100, 5)));
        assert_eq!(slice, b"");
    }

    #[test]
    fn envelope_shape() {
        let env = String::from_utf8(envelope(RAW)).unwrap();
        assert!(env.starts_with("(\"Mon, 7 Feb 1994 21:52:25 -0800\" \"afternoon meeting\" "));
        assert!(env.contains("((\"Alice Price\" NIL alice example.tld))"));
        // two recipients
        assert!(env.contains("((NIL NIL bob example.tld)(\"Carol\" NIL carol x.org))"));
        // sender and reply-to default to from
        let from_count = env.matches("alice example.tld").count();
        assert_eq!(from_count, 3);
        assert!(env.ends_with("\"<B27397-0100000@cac.washington.edu>\")"));
    }

    #[test]
    fn body_structure_text_plain() {
        let bs = String::from_utf8(body_structure(RAW, false)).unwrap();
        assert!(bs.starts_with("(TEXT PLAIN (\"CHARSET\" US-ASCII) NIL NIL 7BIT "));
        assert!(bs.ends_with(" 1)"));
        let ext = String::from_utf8(body_structure(RAW, true)).unwrap();
        assert!(ext.contains("NIL NIL NIL NIL)"));
    }

    #[test]
    fn internal_date_format() {
        let dt = chrono::Utc
            .with_ymd_and_hms(1996, 7, 17, 2, 44, 25)
            .unwrap();
        assert_eq!(internal_date_string(&dt), "17-Jul-1996 02:44:25 +0000");
        let dt = chrono::Utc.with_ymd_and_hms(2021, 2, 3, 0, 0, 0).unwrap();
        assert_eq!(internal_date_string(&dt), " 3-Feb-2021 00:00:00 +0000");
    }

    #[test]
    fn need_body_detection() {
        use crate::imap::types::FetchItem;
        assert!(!items_need_body(&[FetchItem::of(FetchItemType::Flags)]));
        assert!(items_need_body(&[FetchItem::of(FetchItemType::Envelope)]));
        assert!(items_need_body(&[FetchItem::of(FetchItemType::Rfc822Size), FetchItem::of(FetchItemType::Body)]));
    }
}
