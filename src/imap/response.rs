//! Response line assembly.
//!
//! Every outbound line is built in memory (literals included) and then handed
//! to the session's guarded writer, so interleaving with fan-out updates
//! happens at line granularity. Strings pick the cheapest safe wire form:
//! atom, quoted, or literal.

use super::utf7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringForm {
    AtomSafe,
    QuoteSafe,
    LiteralRequired,
}

/// Classify an outbound string: atom-safe (A-Z a-z 0-9 `-` `_` `.`),
/// quote-safe (printable, no control, no `"` or `\`), literal otherwise.
pub fn classify(bytes: &[u8]) -> StringForm {
    if bytes.is_empty() {
        return StringForm::QuoteSafe;
    }
    let mut form = StringForm::AtomSafe;
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => (),
            b'"' | b'\\' => return StringForm::LiteralRequired,
            0x20..=0x7e => form = StringForm::QuoteSafe,
            _ => return StringForm::LiteralRequired,
        }
    }
    form
}

/// One response line under construction. `finish` appends the CRLF.
pub struct Line {
    buf: Vec<u8>,
}

impl Line {
    /// Bare fragment builder (envelope bodies, nested lists).
    pub fn fragment() -> Self {
        Self { buf: Vec::new() }
    }

    /// The bytes built so far, without a CRLF.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn untagged() -> Self {
        Self {
            buf: b"* ".to_vec(),
        }
    }

    pub fn tagged(tag: &str) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(tag.as_bytes());
        buf.push(b' ');
        Self { buf }
    }

    pub fn raw(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Splice pre-rendered bytes (an envelope fragment, a body structure).
    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn number(self, n: u64) -> Self {
        let s = n.to_string();
        self.raw(&s)
    }

    pub fn sp(mut self) -> Self {
        self.buf.push(b' ');
        self
    }

    /// Write a string in its cheapest safe form.
    pub fn string(mut self, bytes: &[u8]) -> Self {
        match classify(bytes) {
            StringForm::AtomSafe => self.buf.extend_from_slice(bytes),
            StringForm::QuoteSafe => {
                self.buf.push(b'"');
                self.buf.extend_from_slice(bytes);
                self.buf.push(b'"');
            }
            StringForm::LiteralRequired => return self.literal(bytes),
        }
        self
    }

    /// `{N}CRLF` then the payload; the line continues after it.
    pub fn literal(mut self, bytes: &[u8]) -> Self {
        self.buf
            .extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    /// NIL or a string.
    pub fn nstring(self, bytes: Option<&[u8]>) -> Self {
        match bytes {
            Some(b) => self.string(b),
            None => self.raw("NIL"),
        }
    }

    /// Mailbox name, re-encoded to Modified UTF-7 on the way out.
    pub fn mailbox(self, name: &str) -> Self {
        let encoded = utf7::encode_mailbox_name(name);
        self.string(encoded.as_bytes())
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b"\r\n");
        self.buf
    }
}

/// Tagged status completions.
pub fn ok(tag: &str, text: &str) -> Vec<u8> {
    Line::tagged(tag).raw("OK ").raw(text).finish()
}

pub fn ok_code(tag: &str, code: &str, text: &str) -> Vec<u8> {
    Line::tagged(tag)
        .raw("OK [")
        .raw(code)
        .raw("] ")
        .raw(text)
        .finish()
}

pub fn no(tag: &str, text: &str) -> Vec<u8> {
    Line::tagged(tag).raw("NO ").raw(text).finish()
}

pub fn bad(tag: &str, text: &str) -> Vec<u8> {
    Line::tagged(tag).raw("BAD ").raw(text).finish()
}

pub fn untagged_bad(text: &str) -> Vec<u8> {
    Line::untagged().raw("BAD ").raw(text).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify(b"INBOX"), StringForm::AtomSafe);
        assert_eq!(classify(b"box.name-1_2"), StringForm::AtomSafe);
        assert_eq!(classify(b"two words"), StringForm::QuoteSafe);
        assert_eq!(classify(b""), StringForm::QuoteSafe);
        assert_eq!(classify(b"a\"b"), StringForm::LiteralRequired);
        assert_eq!(classify(b"a\\b"), StringForm::LiteralRequired);
        assert_eq!(classify(b"line\r\nbreak"), StringForm::LiteralRequired);
        assert_eq!(classify("caf\u{e9}".as_bytes()), StringForm::LiteralRequired);
    }

    #[test]
    fn line_forms() {
        let line = Line::untagged()
            .raw("STATUS ")
            .string(b"two words")
            .raw(" (MESSAGES 4)")
            .finish();
        assert_eq!(line, b"* STATUS \"two words\" (MESSAGES 4)\r\n");

        let line = Line::tagged("a01").raw("OK done").finish();
        assert_eq!(line, b"a01 OK done\r\n");
    }

    #[test]
    fn literal_embeds_payload() {
        let line = Line::untagged()
            .raw("1 FETCH (BODY[] ")
            .literal(b"raw\r\nbytes")
            .raw(")")
            .finish();
        assert_eq!(
            line,
            b"* 1 FETCH (BODY[] {10}\r\nraw\r\nbytes)\r\n".to_vec()
        );
    }

    #[test]
    fn string_escalates_to_literal() {
        let line = Line::untagged().string(b"a\"b").finish();
        assert_eq!(line, b"* {3}\r\na\"b\r\n".to_vec());
    }

    #[test]
    fn mailbox_reencodes_utf7() {
        let line = Line::untagged()
            .raw("LIST () \"/\" ")
            .mailbox("caf\u{e9}")
            .finish();
        assert_eq!(line, b"* LIST () \"/\" \"caf&AOk-\"\r\n".to_vec());
    }

    #[test]
    fn nil_handling() {
        let line = Line::untagged().nstring(None).sp().nstring(Some(b"x")).finish();
        assert_eq!(line, b"* NIL x\r\n");
    }
}
