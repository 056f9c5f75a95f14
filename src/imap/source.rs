//! Code-point oriented view over the connection's read half.
//!
//! The lexer works one rune at a time with a single level of lookback and
//! bounded lookahead; literal payloads bypass rune decoding entirely. The
//! buffer has a fixed capacity: when a full rune cannot be decoded at the end
//! the window slides left, always preserving the bytes of the last consumed
//! rune so that `unget_rune` keeps working across the slide.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUF: usize = 4096;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("read: {0}")]
    Io(#[from] std::io::Error),
    #[error("input buffer overflow")]
    BufferFull,
    #[error("unget without a consumed rune")]
    UngetTwice,
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

pub struct Source<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,

    // one-rune lookback
    last_len: usize,
    last_char: char,
    prev_col: u32,

    replace_null: bool,
    saw_null: bool,

    line: u32,
    col: u32,
    offset: u64,
}

impl<R: AsyncRead + Unpin> Source<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_BUF)
    }

    pub fn with_capacity(inner: R, cap: usize) -> Self {
        Self {
            inner,
            buf: vec![0; cap],
            start: 0,
            end: 0,
            eof: false,
            last_len: 0,
            last_char: '\0',
            prev_col: 0,
            replace_null: false,
            saw_null: false,
            line: 0,
            col: 0,
            offset: 0,
        }
    }

    /// Enable NUL replacement: a zero byte reads as U+FFFD (RFC 3501 §3.3
    /// forbids NUL anywhere in the protocol stream).
    pub fn set_replace_null(&mut self, on: bool) {
        self.replace_null = on;
    }

    pub fn saw_null(&self) -> bool {
        self.saw_null
    }

    /// `(line, column, byte offset)`. Column is a byte count within the
    /// current line and resets on LF.
    pub fn position(&self) -> (u32, u32, u64) {
        (self.line, self.col, self.offset)
    }

    /// Tear the source apart for a transport swap: returns the bytes already
    /// buffered but not yet consumed, and the inner reader.
    pub fn into_parts(self) -> (Vec<u8>, R) {
        (self.buf[self.start..self.end].to_vec(), self.inner)
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    /// Make at least `n` bytes available at `start`, sliding the window if
    /// needed. Returns the number actually available (short only at EOF).
    async fn ensure(&mut self, n: usize) -> Result<usize, SourceError> {
        while self.available() < n && !self.eof {
            if self.end == self.buf.len() {
                // Preserve the last consumed rune for unget.
                let keep = self.start - self.last_len;
                if keep == 0 {
                    return Err(SourceError::BufferFull);
                }
                self.buf.copy_within(keep..self.end, 0);
                self.start -= keep;
                self.end -= keep;
            }
            let got = self.inner.read(&mut self.buf[self.end..]).await?;
            if got == 0 {
                self.eof = true;
            }
            self.end += got;
        }
        Ok(self.available().min(n))
    }

    /// Decode the rune at `start + at` without consuming. Requires the bytes
    /// to already be buffered (callers go through `ensure`).
    fn decode_at(&self, at: usize) -> Option<(char, usize)> {
        let bytes = &self.buf[self.start + at..self.end];
        let first = *bytes.first()?;
        if first == 0 && self.replace_null {
            return Some(('\u{fffd}', 1));
        }
        if first < 0x80 {
            return Some((first as char, 1));
        }
        let want = match first {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return Some(('\u{fffd}', 1)),
        };
        if bytes.len() < want {
            // Truncated sequence at EOF decodes as a replacement; otherwise
            // the caller must buffer more first.
            if self.eof {
                return Some(('\u{fffd}', 1));
            }
            return None;
        }
        match std::str::from_utf8(&bytes[..want]) {
            Ok(s) => s.chars().next().map(|c| (c, want)),
            Err(_) => Some(('\u{fffd}', 1)),
        }
    }

    async fn fill_rune(&mut self, at: usize) -> Result<Option<(char, usize)>, SourceError> {
        loop {
            self.ensure(at + 4).await?;
            if self.available() <= at {
                return Ok(None); // EOF
            }
            match self.decode_at(at) {
                Some(r) => return Ok(Some(r)),
                None => continue,
            }
        }
    }

    /// Look at the next rune without consuming it. `None` is EOF.
    pub async fn peek_rune(&mut self) -> Result<Option<char>, SourceError> {
        Ok(self.fill_rune(0).await?.map(|(c, _)| c))
    }

    /// Fill `out` with upcoming runes without consuming; trailing slots stay
    /// `None` when the stream ends first.
    pub async fn peek_runes(&mut self, out: &mut [Option<char>]) -> Result<(), SourceError> {
        let mut at = 0;
        for slot in out.iter_mut() {
            match self.fill_rune(at).await? {
                Some((c, len)) => {
                    *slot = Some(c);
                    at += len;
                }
                None => *slot = None,
            }
        }
        Ok(())
    }

    /// Consume one rune. `None` is EOF.
    pub async fn get_rune(&mut self) -> Result<Option<char>, SourceError> {
        let (c, len) = match self.fill_rune(0).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        if c == '\u{fffd}' && self.buf[self.start] == 0 {
            self.saw_null = true;
        }
        self.start += len;
        self.offset += len as u64;
        if c == '\n' {
            self.prev_col = self.col;
            self.line += 1;
            self.col = 0;
        } else {
            self.col += len as u32;
        }
        self.last_len = len;
        self.last_char = c;
        Ok(Some(c))
    }

    /// Push the last consumed rune back. Exactly one level is supported.
    pub fn unget_rune(&mut self) -> Result<(), SourceError> {
        if self.last_len == 0 {
            return Err(SourceError::UngetTwice);
        }
        self.start -= self.last_len;
        self.offset -= self.last_len as u64;
        if self.last_char == '\n' {
            self.line -= 1;
            self.col = self.prev_col;
        } else {
            self.col -= self.last_len as u32;
        }
        self.last_len = 0;
        Ok(())
    }

    /// Raw passthrough for literal payloads: append exactly `n` bytes to
    /// `out`, bypassing rune decoding. Invalidates the unget slot.
    pub async fn read_bytes(&mut self, out: &mut Vec<u8>, n: usize) -> Result<(), SourceError> {
        self.last_len = 0;
        let mut remaining = n;
        while remaining > 0 {
            if self.available() == 0 {
                if self.eof {
                    return Err(SourceError::UnexpectedEof);
                }
                self.start = 0;
                self.end = 0;
                let got = self.inner.read(&mut self.buf).await?;
                if got == 0 {
                    self.eof = true;
                    continue;
                }
                self.end = got;
            }
            let take = self.available().min(remaining);
            let chunk = &self.buf[self.start..self.start + take];
            out.extend_from_slice(chunk);
            for &b in chunk {
                if b == b'\n' {
                    self.prev_col = self.col;
                    self.line += 1;
                    self.col = 0;
                } else {
                    self.col += 1;
                }
            }
            self.start += take;
            self.offset += take as u64;
            remaining -= take;
        }
        Ok(())
    }
}
