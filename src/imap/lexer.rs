//! Directed IMAP tokenizer.
//!
//! The lexer produces exactly one token per call and the caller names the
//! token class it expects, because the IMAP grammar is context-sensitive: the
//! same bytes lex differently in a sequence-set slot and in an atom slot.
//! Literals suspend mid-token to emit a continuation request through the
//! registered sink before the payload bytes are consumed.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use super::source::{Source, SourceError};
use super::types::{
    FetchItem, FetchItemType, FetchMacro, Flag, Section, SectionName, SeqRange, SequenceSet,
};

/// Default cap for quoted strings and bounded literals (string slots).
pub const DEFAULT_STRING_MAX: usize = 1024;
/// Default cap for streaming literals (APPEND payloads).
pub const DEFAULT_LITERAL_MAX: usize = 64 << 20;

pub const CONTINUATION_READY: &str = "+ Ready for additional text\r\n";

/// Where the lexer writes continuation requests. The session's write half
/// implements this; tests use an in-memory recorder.
#[async_trait]
pub trait ContinuationSink: Send + Sync {
    async fn continuation(&mut self, text: &str, octets: u64) -> std::io::Result<()>;
}

#[derive(Debug, Error)]
pub enum LexError {
    /// Fatal: the connection is unusable.
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("continuation write: {0}")]
    Sink(std::io::Error),
    /// Recoverable: reported as BAD, the line is drained.
    #[error("{0}")]
    Parse(String),
}

impl LexError {
    fn parse(msg: impl Into<String>) -> Self {
        LexError::Parse(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LexError::Source(_) | LexError::Sink(_))
    }
}

/// Token class requested by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Whatever comes naturally: atom, string, list-open, list-close.
    Unknown,
    Atom,
    Number,
    /// astring: atom, quoted string or bounded literal.
    String,
    /// Streaming literal (APPEND payload).
    Literal,
    ListStart,
    ListEnd,
    Flag,
    Sequences,
    Tag,
    /// Sequence-set, `(`, `)` or atom; used inside search programs.
    SearchKey,
    FetchItem,
    Date,
    /// astring plus the list-wildcards `%` and `*`.
    ListMailbox,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Atom(String),
    /// Quoted string or bounded literal.
    Str(Vec<u8>),
    /// Streaming literal.
    Literal(Vec<u8>),
    Number(u64),
    ListStart,
    ListEnd,
    Flag(Flag),
    Sequences(SequenceSet),
    Tag(String),
    FetchItem(FetchItem),
    FetchMacro(FetchMacro),
    Date(DateTime<Utc>),
}

pub struct Lexer<R> {
    src: Source<R>,
    sink: Option<Box<dyn ContinuationSink>>,
    pub string_max: usize,
    pub literal_max: usize,
    /// True right after an end-of-line was consumed; the drain path uses it
    /// to avoid eating the next command's line.
    at_line_start: bool,
}

impl<R: AsyncRead + Unpin> Lexer<R> {
    pub fn new(mut src: Source<R>) -> Self {
        src.set_replace_null(true);
        Self {
            src,
            sink: None,
            string_max: DEFAULT_STRING_MAX,
            literal_max: DEFAULT_LITERAL_MAX,
            at_line_start: true,
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn ContinuationSink>) {
        self.sink = Some(sink);
    }

    pub fn into_source(self) -> Source<R> {
        self.src
    }

    /// Require an expected token.
    pub async fn next(&mut self, expect: Expect) -> Result<Token, LexError> {
        match self.next_or_end(expect).await? {
            Some(tok) => Ok(tok),
            None => Err(LexError::parse("unexpected end of command")),
        }
    }

    /// Expected token, or `None` when the line ends here.
    pub async fn next_or_end(&mut self, expect: Expect) -> Result<Option<Token>, LexError> {
        self.skip_spaces().await?;
        match self.src.peek_rune().await? {
            None => {
                return Err(LexError::Source(SourceError::UnexpectedEof));
            }
            Some('\r') | Some('\n') => {
                self.consume_eol().await?;
                return Ok(None);
            }
            Some(_) => (),
        }
        self.at_line_start = false;
        let tok = match expect {
            Expect::Unknown => self.lex_unknown().await?,
            Expect::Atom => Token::Atom(self.lex_atom("").await?),
            Expect::Number => Token::Number(self.lex_number().await?),
            Expect::String => Token::Str(self.lex_astring().await?),
            Expect::Literal => Token::Literal(self.lex_literal(self.literal_max).await?),
            Expect::ListStart => {
                self.expect_char('(').await?;
                Token::ListStart
            }
            Expect::ListEnd => {
                self.expect_char(')').await?;
                Token::ListEnd
            }
            Expect::Flag => Token::Flag(self.lex_flag().await?),
            Expect::Sequences => Token::Sequences(self.lex_sequences().await?),
            Expect::Tag => Token::Tag(self.lex_tag().await?),
            Expect::SearchKey => self.lex_search_key().await?,
            Expect::FetchItem => self.lex_fetch_item().await?,
            Expect::Date => Token::Date(self.lex_date().await?),
            Expect::ListMailbox => Token::Str(self.lex_list_mailbox().await?),
        };
        Ok(Some(tok))
    }

    /// Require the end of the command line.
    pub async fn end(&mut self) -> Result<(), LexError> {
        self.skip_spaces().await?;
        match self.src.peek_rune().await? {
            Some('\r') | Some('\n') => self.consume_eol().await,
            Some(c) => Err(LexError::parse(format!("expected end of command, got {:?}", c))),
            None => Err(LexError::Source(SourceError::UnexpectedEof)),
        }
    }

    /// Resynchronize to the start of the next line after a parse error.
    pub async fn drain_line(&mut self) -> Result<(), LexError> {
        if self.at_line_start {
            return Ok(());
        }
        loop {
            match self.src.get_rune().await? {
                None => return Err(LexError::Source(SourceError::UnexpectedEof)),
                Some('\n') => {
                    self.at_line_start = true;
                    return Ok(());
                }
                Some(_) => (),
            }
        }
    }

    /// Read one raw line (through CRLF, not included). Used by IDLE to wait
    /// for `DONE`.
    pub async fn read_line(&mut self) -> Result<String, LexError> {
        let mut line = String::new();
        loop {
            match self.src.get_rune().await? {
                None => return Err(LexError::Source(SourceError::UnexpectedEof)),
                Some('\n') => {
                    self.at_line_start = true;
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    return Ok(line);
                }
                Some(c) => {
                    if line.len() > 8192 {
                        return Err(LexError::parse("line too long"));
                    }
                    line.push(c);
                }
            }
        }
    }

    /// Emit a continuation request outside the literal path (AUTHENTICATE
    /// uses the bare `+\r\n` form).
    pub async fn send_continuation(&mut self, text: &str) -> Result<(), LexError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.continuation(text, 0).await.map_err(LexError::Sink)?;
        }
        Ok(())
    }

    /// Skip spaces and look at the next significant character without
    /// consuming it. Drives the parser's optional-group decisions.
    pub async fn peek_char(&mut self) -> Result<Option<char>, LexError> {
        self.skip_spaces().await?;
        Ok(self.src.peek_rune().await?)
    }

    /// Consume `c` if it is the next significant character.
    pub async fn eat_char(&mut self, c: char) -> Result<bool, LexError> {
        if self.peek_char().await? == Some(c) {
            self.src.get_rune().await?;
            self.at_line_start = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- internals ----

    async fn skip_spaces(&mut self) -> Result<(), LexError> {
        while let Some(' ') = self.src.peek_rune().await? {
            self.src.get_rune().await?;
        }
        Ok(())
    }

    async fn consume_eol(&mut self) -> Result<(), LexError> {
        match self.src.get_rune().await? {
            Some('\r') => match self.src.get_rune().await? {
                Some('\n') => {
                    self.at_line_start = true;
                    Ok(())
                }
                _ => Err(LexError::parse("CR not followed by LF")),
            },
            // Lone LF accepted permissively.
            Some('\n') => {
                self.at_line_start = true;
                Ok(())
            }
            _ => Err(LexError::parse("expected end of line")),
        }
    }

    async fn expect_char(&mut self, want: char) -> Result<(), LexError> {
        match self.src.get_rune().await? {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(LexError::parse(format!("expected {:?}, got {:?}", want, c))),
            None => Err(LexError::Source(SourceError::UnexpectedEof)),
        }
    }

    /// atom-char per RFC 3501 §9: printable ASCII minus the atom-specials.
    fn is_atom_char(c: char, extra: &str) -> bool {
        if extra.contains(c) {
            return true;
        }
        match c {
            '(' | ')' | '{' | ' ' | '%' | '*' | '"' | '\\' | ']' => false,
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => false,
            _ => true,
        }
    }

    /// Collect atom chars, stopping (and ungetting) at the first byte outside
    /// the class. `extra` widens the class (list-wildcards, …).
    async fn lex_atom(&mut self, extra: &str) -> Result<String, LexError> {
        let mut out = String::new();
        loop {
            match self.src.get_rune().await? {
                None => break,
                Some(c) if Self::is_atom_char(c, extra) => out.push(c),
                Some(_) => {
                    self.src.unget_rune()?;
                    break;
                }
            }
        }
        if out.is_empty() {
            return Err(LexError::parse("expected atom"));
        }
        Ok(out)
    }

    async fn lex_tag(&mut self) -> Result<String, LexError> {
        // tag = 1*<any ASTRING-CHAR except "+">
        let mut out = String::new();
        loop {
            match self.src.get_rune().await? {
                None => break,
                Some(c) if c != '+' && Self::is_atom_char(c, "") => out.push(c),
                Some(_) => {
                    self.src.unget_rune()?;
                    break;
                }
            }
        }
        if out.is_empty() {
            return Err(LexError::parse("expected command tag"));
        }
        Ok(out)
    }

    async fn lex_number(&mut self) -> Result<u64, LexError> {
        let mut n: u64 = 0;
        let mut any = false;
        loop {
            match self.src.get_rune().await? {
                Some(c @ '0'..='9') => {
                    any = true;
                    n = n
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(c as u64 - '0' as u64))
                        .ok_or_else(|| LexError::parse("number too large"))?;
                }
                Some(_) => {
                    self.src.unget_rune()?;
                    break;
                }
                None => break,
            }
        }
        if !any {
            return Err(LexError::parse("expected number"));
        }
        Ok(n)
    }

    async fn lex_unknown(&mut self) -> Result<Token, LexError> {
        match self.src.peek_rune().await? {
            Some('(') => {
                self.src.get_rune().await?;
                Ok(Token::ListStart)
            }
            Some(')') => {
                self.src.get_rune().await?;
                Ok(Token::ListEnd)
            }
            Some('"') => Ok(Token::Str(self.lex_quoted().await?)),
            Some('{') => Ok(Token::Str(self.lex_bounded_literal().await?)),
            _ => Ok(Token::Atom(self.lex_atom("").await?)),
        }
    }

    async fn lex_astring(&mut self) -> Result<Vec<u8>, LexError> {
        match self.src.peek_rune().await? {
            Some('"') => self.lex_quoted().await,
            Some('{') => self.lex_bounded_literal().await,
            _ => Ok(self.lex_atom("").await?.into_bytes()),
        }
    }

    async fn lex_list_mailbox(&mut self) -> Result<Vec<u8>, LexError> {
        match self.src.peek_rune().await? {
            Some('"') => self.lex_quoted().await,
            Some('{') => self.lex_bounded_literal().await,
            _ => Ok(self.lex_atom("%*").await?.into_bytes()),
        }
    }

    async fn lex_quoted(&mut self) -> Result<Vec<u8>, LexError> {
        self.expect_char('"').await?;
        let mut out = Vec::new();
        loop {
            match self.src.get_rune().await? {
                None => return Err(LexError::Source(SourceError::UnexpectedEof)),
                Some('"') => return Ok(out),
                Some('\\') => match self.src.get_rune().await? {
                    Some(c @ ('"' | '\\')) => out.push(c as u8),
                    _ => return Err(LexError::parse("bad escape in quoted string")),
                },
                Some('\r') | Some('\n') => {
                    return Err(LexError::parse("newline inside quoted string"))
                }
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
            if out.len() > self.string_max {
                return Err(LexError::parse("quoted string too long"));
            }
        }
    }

    async fn lex_bounded_literal(&mut self) -> Result<Vec<u8>, LexError> {
        let max = self.string_max;
        self.lex_literal(max).await
    }

    /// `{N}CRLF` then exactly N raw bytes. The continuation request is
    /// flushed through the sink before the payload read starts.
    async fn lex_literal(&mut self, max: usize) -> Result<Vec<u8>, LexError> {
        self.expect_char('{').await?;
        let n = self.lex_number().await?;
        self.expect_char('}').await?;
        self.consume_eol_strict().await?;
        // The header line is fully consumed here. On rejection no
        // continuation goes out, the client is still waiting, and the drain
        // path must not block on a line that will never come.
        self.at_line_start = true;
        if n as usize > max {
            return Err(LexError::parse(format!("literal too long ({} octets)", n)));
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.continuation(CONTINUATION_READY, n)
                .await
                .map_err(LexError::Sink)?;
        }
        let mut out = Vec::with_capacity((n as usize).min(1 << 20));
        self.src.read_bytes(&mut out, n as usize).await?;
        self.at_line_start = false;
        Ok(out)
    }

    async fn consume_eol_strict(&mut self) -> Result<(), LexError> {
        match self.src.get_rune().await? {
            Some('\r') => match self.src.get_rune().await? {
                Some('\n') => Ok(()),
                _ => Err(LexError::parse("CR not followed by LF")),
            },
            Some('\n') => Ok(()),
            _ => Err(LexError::parse("expected CRLF after literal length")),
        }
    }

    async fn lex_flag(&mut self) -> Result<Flag, LexError> {
        match self.src.peek_rune().await? {
            Some('\\') => {
                self.src.get_rune().await?;
                let name = self.lex_atom("").await?;
                Flag::system(&name)
                    .ok_or_else(|| LexError::parse(format!("unknown system flag \\{}", name)))
            }
            _ => Ok(Flag::Keyword(self.lex_atom("").await?)),
        }
    }

    async fn lex_seq_number(&mut self) -> Result<u32, LexError> {
        match self.src.peek_rune().await? {
            Some('*') => {
                self.src.get_rune().await?;
                Ok(0)
            }
            Some('1'..='9') => {
                let n = self.lex_number().await?;
                u32::try_from(n).map_err(|_| LexError::parse("sequence number too large"))
            }
            Some('0') => Err(LexError::parse("sequence numbers start at 1")),
            _ => Err(LexError::parse("expected sequence number")),
        }
    }

    async fn lex_sequences(&mut self) -> Result<SequenceSet, LexError> {
        let mut set = SequenceSet::default();
        loop {
            let a = self.lex_seq_number().await?;
            let range = match self.src.peek_rune().await? {
                Some(':') => {
                    self.src.get_rune().await?;
                    let b = self.lex_seq_number().await?;
                    SeqRange::new(a, b)
                }
                _ => SeqRange::single(a),
            };
            set.0.push(range);
            match self.src.peek_rune().await? {
                Some(',') => {
                    self.src.get_rune().await?;
                }
                _ => break,
            }
        }
        Ok(set)
    }

    async fn lex_search_key(&mut self) -> Result<Token, LexError> {
        match self.src.peek_rune().await? {
            Some('(') => {
                self.src.get_rune().await?;
                Ok(Token::ListStart)
            }
            Some(')') => {
                self.src.get_rune().await?;
                Ok(Token::ListEnd)
            }
            Some('*') | Some('0'..='9') => Ok(Token::Sequences(self.lex_sequences().await?)),
            _ => Ok(Token::Atom(self.lex_atom("").await?)),
        }
    }

    async fn lex_date(&mut self) -> Result<DateTime<Utc>, LexError> {
        let quoted = matches!(self.src.peek_rune().await?, Some('"'));
        if quoted {
            self.src.get_rune().await?;
        }
        let mut text = String::new();
        loop {
            match self.src.get_rune().await? {
                None => break,
                Some('"') if quoted => break,
                Some(c) if c.is_ascii_alphanumeric() || c == '-' => text.push(c),
                Some(_) if quoted => return Err(LexError::parse("bad date")),
                Some(_) => {
                    self.src.unget_rune()?;
                    break;
                }
            }
        }
        parse_date(&text).ok_or_else(|| LexError::parse(format!("bad date {:?}", text)))
    }

    async fn lex_fetch_item(&mut self) -> Result<Token, LexError> {
        // NAME[.PEEK] up to an optional section bracket.
        let mut name = String::new();
        loop {
            match self.src.get_rune().await? {
                None => break,
                Some(c) if Self::is_atom_char(c, "") && c != '[' => name.push(c),
                Some('[') => {
                    self.src.unget_rune()?;
                    break;
                }
                Some(_) => {
                    self.src.unget_rune()?;
                    break;
                }
            }
        }
        let upper = name.to_ascii_uppercase();
        let (base, peek) = match upper.strip_suffix(".PEEK") {
            Some(b) => (b, true),
            None => (upper.as_str(), false),
        };
        let item = match base {
            "ALL" => return Ok(Token::FetchMacro(FetchMacro::All)),
            "FAST" => return Ok(Token::FetchMacro(FetchMacro::Fast)),
            "FULL" => return Ok(Token::FetchMacro(FetchMacro::Full)),
            "ENVELOPE" => FetchItemType::Envelope,
            "FLAGS" => FetchItemType::Flags,
            "INTERNALDATE" => FetchItemType::InternalDate,
            "RFC822" => FetchItemType::Rfc822,
            "RFC822.HEADER" => FetchItemType::Rfc822Header,
            "RFC822.SIZE" => FetchItemType::Rfc822Size,
            "RFC822.TEXT" => FetchItemType::Rfc822Text,
            "UID" => FetchItemType::Uid,
            "BODYSTRUCTURE" => FetchItemType::BodyStructure,
            "MODSEQ" => FetchItemType::ModSeq,
            "BODY" => FetchItemType::Body,
            _ => return Err(LexError::parse(format!("unknown fetch item {}", name))),
        };
        if peek && item != FetchItemType::Body {
            return Err(LexError::parse(".PEEK is only valid on BODY"));
        }
        let mut fi = FetchItem {
            item,
            peek,
            section: None,
            partial: None,
        };
        if item == FetchItemType::Body {
            if let Some('[') = self.src.peek_rune().await? {
                self.src.get_rune().await?;
                fi.section = Some(self.lex_section().await?);
                if let Some('<') = self.src.peek_rune().await? {
                    fi.partial = Some(self.lex_partial().await?);
                }
            } else if peek {
                return Err(LexError::parse("BODY.PEEK requires a section"));
            }
        }
        Ok(Token::FetchItem(fi))
    }

    /// Section body after `[`: dotted part path, optional named part, and for
    /// HEADER.FIELDS{,.NOT} a parenthesized header list. Consumes `]`.
    async fn lex_section(&mut self) -> Result<Section, LexError> {
        let mut section = Section::default();
        loop {
            match self.src.peek_rune().await? {
                Some(']') => {
                    self.src.get_rune().await?;
                    return Ok(section);
                }
                Some('0'..='9') => {
                    let n = self.lex_number().await?;
                    let part =
                        u16::try_from(n).map_err(|_| LexError::parse("part number too large"))?;
                    if part == 0 {
                        return Err(LexError::parse("part numbers start at 1"));
                    }
                    section.parts.push(part);
                    match self.src.peek_rune().await? {
                        Some('.') => {
                            self.src.get_rune().await?;
                        }
                        Some(']') => (),
                        _ => return Err(LexError::parse("bad section part list")),
                    }
                }
                Some(_) => {
                    let mut word = String::new();
                    loop {
                        match self.src.get_rune().await? {
                            Some(c) if c.is_ascii_alphabetic() || c == '.' => {
                                word.push(c.to_ascii_uppercase())
                            }
                            Some(_) => {
                                self.src.unget_rune()?;
                                break;
                            }
                            None => break,
                        }
                    }
                    section.name = match word.as_str() {
                        "HEADER" => SectionName::Header,
                        "HEADER.FIELDS" => SectionName::HeaderFields,
                        "HEADER.FIELDS.NOT" => SectionName::HeaderFieldsNot,
                        "TEXT" => SectionName::Text,
                        "MIME" if !section.parts.is_empty() => SectionName::Mime,
                        "MIME" => return Err(LexError::parse("MIME requires a part path")),
                        _ => return Err(LexError::parse(format!("bad section {:?}", word))),
                    };
                    if matches!(
                        section.name,
                        SectionName::HeaderFields | SectionName::HeaderFieldsNot
                    ) {
                        self.skip_spaces().await?;
                        self.expect_char('(').await?;
                        loop {
                            self.skip_spaces().await?;
                            if let Some(')') = self.src.peek_rune().await? {
                                self.src.get_rune().await?;
                                break;
                            }
                            let name = self.lex_astring().await?;
                            let name = String::from_utf8(name)
                                .map_err(|_| LexError::parse("bad header field name"))?;
                            section.fields.push(name);
                        }
                        if section.fields.is_empty() {
                            return Err(LexError::parse("empty header field list"));
                        }
                    }
                    self.expect_char(']').await?;
                    return Ok(section);
                }
                None => return Err(LexError::Source(SourceError::UnexpectedEof)),
            }
        }
    }

    /// `<start.length>` byte range.
    async fn lex_partial(&mut self) -> Result<(u32, u32), LexError> {
        self.expect_char('<').await?;
        let start = self.lex_number().await?;
        self.expect_char('.').await?;
        let len = self.lex_number().await?;
        self.expect_char('>').await?;
        let start = u32::try_from(start).map_err(|_| LexError::parse("partial start too large"))?;
        let len = u32::try_from(len).map_err(|_| LexError::parse("partial length too large"))?;
        if len == 0 {
            return Err(LexError::parse("partial length cannot be 0"));
        }
        Ok((start, len))
    }
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// `[dd]-MMM-yyyy`, month case-insensitive, midnight UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let mut parts = s.splitn(3, '-');
    let day: u32 = parts.next()?.parse().ok()?;
    let mon = parts.next()?.to_ascii_lowercase();
    let year: i32 = parts.next()?.parse().ok()?;
    let month = MONTHS.iter().position(|m| *m == mon)? as u32 + 1;
    let date = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&date))
}

/// APPEND date-time: `dd-MMM-yyyy HH:MM:SS +zzzz`, day possibly space padded.
pub fn parse_date_time(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    DateTime::parse_from_str(s, "%d-%b-%Y %H:%M:%S %z")
        .or_else(|_| DateTime::parse_from_str(s, "%e-%b-%Y %H:%M:%S %z"))
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct RecordingSink(pub Vec<(String, u64)>);

    #[async_trait]
    impl ContinuationSink for RecordingSink {
        async fn continuation(&mut self, text: &str, octets: u64) -> std::io::Result<()> {
            self.0.push((text.to_string(), octets));
            Ok(())
        }
    }

    fn lexer(input: &[u8]) -> Lexer<&[u8]> {
        Lexer::new(Source::new(input))
    }

    #[tokio::test]
    async fn atoms_and_tags() {
        let mut lx = lexer(b"a01 NOOP\r\n");
        assert_eq!(lx.next(Expect::Tag).await.unwrap(), Token::Tag("a01".into()));
        assert_eq!(
            lx.next(Expect::Atom).await.unwrap(),
            Token::Atom("NOOP".into())
        );
        lx.end().await.unwrap();
    }

    #[tokio::test]
    async fn tag_stops_at_plus() {
        let mut lx = lexer(b"a+b x\r\n");
        assert_eq!(lx.next(Expect::Tag).await.unwrap(), Token::Tag("a".into()));
        // '+' is a legal atom char though
        assert_eq!(lx.next(Expect::Atom).await.unwrap(), Token::Atom("+b".into()));
    }

    #[tokio::test]
    async fn quoted_string_escapes() {
        let mut lx = lexer(b"\"a\\\"b\\\\c\"\r\n");
        assert_eq!(
            lx.next(Expect::String).await.unwrap(),
            Token::Str(b"a\"b\\c".to_vec())
        );
    }

    #[tokio::test]
    async fn quoted_string_rejects_newline() {
        let mut lx = lexer(b"\"ab\ncd\"\r\n");
        assert!(matches!(
            lx.next(Expect::String).await,
            Err(LexError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn bounded_literal_with_continuation() {
        let mut lx = lexer(b"{5}\r\nhello rest\r\n");
        lx.set_sink(Box::new(RecordingSink(Vec::new())));
        assert_eq!(
            lx.next(Expect::String).await.unwrap(),
            Token::Str(b"hello".to_vec())
        );
        assert_eq!(
            lx.next(Expect::Atom).await.unwrap(),
            Token::Atom("rest".into())
        );
    }

    #[tokio::test]
    async fn bounded_literal_respects_limit() {
        let mut lx = lexer(b"{2000}\r\nxx\r\n");
        lx.string_max = 1024;
        assert!(matches!(
            lx.next(Expect::String).await,
            Err(LexError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn streaming_literal_roundtrip() {
        let mut body = b"{12}\r\n".to_vec();
        body.extend_from_slice(b"From: a\r\n\r\nb");
        body.extend_from_slice(b"\r\n");
        let mut lx = lexer(&body);
        match lx.next(Expect::Literal).await.unwrap() {
            Token::Literal(bytes) => assert_eq!(bytes, b"From: a\r\n\r\nb"),
            other => panic!("unexpected {:?}", other),
        }
        lx.end().await.unwrap();
    }

    #[tokio::test]
    async fn sequence_sets_normalize() {
        let mut lx = lexer(b"9:2,4,*,7:* \r\n");
        match lx.next(Expect::Sequences).await.unwrap() {
            Token::Sequences(set) => {
                assert_eq!(
                    set.0,
                    vec![
                        SeqRange { min: 2, max: 9 },
                        SeqRange::single(4),
                        SeqRange::single(0),
                        SeqRange { min: 7, max: 0 },
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn sequence_rejects_zero() {
        let mut lx = lexer(b"0:4\r\n");
        assert!(matches!(
            lx.next(Expect::Sequences).await,
            Err(LexError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn flags() {
        let mut lx = lexer(b"\\Seen \\deleted Forwarded \\Bogus\r\n");
        assert_eq!(lx.next(Expect::Flag).await.unwrap(), Token::Flag(Flag::Seen));
        assert_eq!(
            lx.next(Expect::Flag).await.unwrap(),
            Token::Flag(Flag::Deleted)
        );
        assert_eq!(
            lx.next(Expect::Flag).await.unwrap(),
            Token::Flag(Flag::Keyword("Forwarded".into()))
        );
        assert!(matches!(lx.next(Expect::Flag).await, Err(LexError::Parse(_))));
    }

    #[tokio::test]
    async fn dates() {
        let mut lx = lexer(b"1-Feb-1994 \"24-dec-2021\"\r\n");
        match lx.next(Expect::Date).await.unwrap() {
            Token::Date(d) => assert_eq!(d.to_rfc3339(), "1994-02-01T00:00:00+00:00"),
            other => panic!("unexpected {:?}", other),
        }
        match lx.next(Expect::Date).await.unwrap() {
            Token::Date(d) => assert_eq!(d.to_rfc3339(), "2021-12-24T00:00:00+00:00"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_items() {
        let mut lx = lexer(
            b"ENVELOPE BODY.PEEK[1.2.HEADER.FIELDS (From \"To\")]<0.2048> BODY[] RFC822.SIZE all\r\n",
        );
        assert_eq!(
            lx.next(Expect::FetchItem).await.unwrap(),
            Token::FetchItem(FetchItem::of(FetchItemType::Envelope))
        );
        match lx.next(Expect::FetchItem).await.unwrap() {
            Token::FetchItem(fi) => {
                assert!(fi.peek);
                let s = fi.section.unwrap();
                assert_eq!(s.parts, vec![1, 2]);
                assert_eq!(s.name, SectionName::HeaderFields);
                assert_eq!(s.fields, vec!["From".to_string(), "To".to_string()]);
                assert_eq!(fi.partial, Some((0, 2048)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match lx.next(Expect::FetchItem).await.unwrap() {
            Token::FetchItem(fi) => {
                assert_eq!(fi.item, FetchItemType::Body);
                assert_eq!(fi.section.unwrap(), Section::default());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            lx.next(Expect::FetchItem).await.unwrap(),
            Token::FetchItem(FetchItem::of(FetchItemType::Rfc822Size))
        );
        assert_eq!(
            lx.next(Expect::FetchItem).await.unwrap(),
            Token::FetchMacro(FetchMacro::All)
        );
    }

    #[tokio::test]
    async fn fetch_item_mime_needs_part() {
        let mut lx = lexer(b"BODY[MIME]\r\n");
        assert!(matches!(
            lx.next(Expect::FetchItem).await,
            Err(LexError::Parse(_))
        ));
        let mut lx = lexer(b"BODY[2.MIME]\r\n");
        match lx.next(Expect::FetchItem).await.unwrap() {
            Token::FetchItem(fi) => {
                let s = fi.section.unwrap();
                assert_eq!(s.parts, vec![2]);
                assert_eq!(s.name, SectionName::Mime);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_mailbox_wildcards() {
        let mut lx = lexer(b"INBOX.% foo*bar\r\n");
        assert_eq!(
            lx.next(Expect::ListMailbox).await.unwrap(),
            Token::Str(b"INBOX.%".to_vec())
        );
        assert_eq!(
            lx.next(Expect::ListMailbox).await.unwrap(),
            Token::Str(b"foo*bar".to_vec())
        );
    }

    #[tokio::test]
    async fn next_or_end() {
        let mut lx = lexer(b"x\r\na\r\n");
        assert!(lx.next_or_end(Expect::Atom).await.unwrap().is_some());
        assert!(lx.next_or_end(Expect::Atom).await.unwrap().is_none());
        // drain after consumed EOL must not eat the next line
        lx.drain_line().await.unwrap();
        assert_eq!(lx.next(Expect::Atom).await.unwrap(), Token::Atom("a".into()));
    }

    #[tokio::test]
    async fn nul_bytes_are_replaced() {
        let mut lx = lexer(b"\"a\0b\"\r\n");
        match lx.next(Expect::String).await.unwrap() {
            Token::Str(s) => assert_eq!(s, "a\u{fffd}b".as_bytes()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn date_time_parsing() {
        let dt = parse_date_time("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(dt.timestamp(), 837596665);
        assert!(parse_date_time(" 7-Jul-1996 02:44:25 -0700").is_some());
        assert!(parse_date_time("17-Jul-1996").is_none());
    }
}
