//! Recursive command parser: one full IMAP command per call.
//!
//! The parser drives the directed lexer token by token. On any recoverable
//! error it drains the input to the next CRLF so the session survives, and
//! reports whether the command tag had already been read (the session picks
//! `<tag> BAD` vs `* BAD` from that).

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncRead;

use super::flow::Mode;
use super::lexer::{parse_date_time, Expect, LexError, Lexer, Token};
use super::types::*;
use super::utf7;

const UID_COMMANDS: [&str; 6] = ["COPY", "FETCH", "STORE", "SEARCH", "MOVE", "EXPUNGE"];

const KNOWN_COMMANDS: [&str; 28] = [
    "CAPABILITY",
    "NOOP",
    "LOGOUT",
    "CHECK",
    "ID",
    "COMPRESS",
    "LOGIN",
    "AUTHENTICATE",
    "ENABLE",
    "SELECT",
    "EXAMINE",
    "CREATE",
    "DELETE",
    "RENAME",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "LIST",
    "LSUB",
    "STATUS",
    "APPEND",
    "IDLE",
    "CLOSE",
    "EXPUNGE",
    "SEARCH",
    "FETCH",
    "STORE",
    "COPY",
    "MOVE",
];

#[derive(Debug)]
pub enum ParseError {
    /// The tag was read before the error: report `<tag> BAD`.
    Tagged { tag: String, msg: String },
    /// No tag yet: report `* BAD`.
    Untagged(String),
    /// I/O failure; the session terminates silently.
    Fatal(LexError),
}

pub struct Parser<R> {
    pub lx: Lexer<R>,
    /// XAPPLEPUSHSERVICE only parses when the APNs bridge is configured.
    pub apple_push_enabled: bool,
}

impl<R: AsyncRead + Unpin + Send> Parser<R> {
    pub fn new(lx: Lexer<R>) -> Self {
        Self {
            lx,
            apple_push_enabled: false,
        }
    }

    pub async fn read_command(&mut self, mode: Mode) -> Result<Command, ParseError> {
        let tag = match self.lx.next(Expect::Tag).await {
            Ok(Token::Tag(t)) => t,
            Ok(_) => unreachable!("Expect::Tag yields Token::Tag"),
            Err(e) if e.is_fatal() => return Err(ParseError::Fatal(e)),
            Err(e) => {
                if let Err(d) = self.lx.drain_line().await {
                    if d.is_fatal() {
                        return Err(ParseError::Fatal(d));
                    }
                }
                return Err(ParseError::Untagged(e.to_string()));
            }
        };
        match self.command_body(mode, &tag).await {
            Ok(cmd) => Ok(cmd),
            Err(e) if e.is_fatal() => Err(ParseError::Fatal(e)),
            Err(e) => {
                if let Err(d) = self.lx.drain_line().await {
                    if d.is_fatal() {
                        return Err(ParseError::Fatal(d));
                    }
                }
                Err(ParseError::Tagged {
                    tag,
                    msg: e.to_string(),
                })
            }
        }
    }

    async fn command_body(&mut self, mode: Mode, tag: &str) -> Result<Command, LexError> {
        let mut name = self.atom().await?.to_ascii_uppercase();
        let mut uid = false;
        if name == "UID" {
            uid = true;
            name = self.atom().await?.to_ascii_uppercase();
            if !UID_COMMANDS.contains(&name.as_str()) {
                return Err(LexError::Parse(format!(
                    "UID prefix not valid on {}",
                    name
                )));
            }
        }
        if name == "XAPPLEPUSHSERVICE" && !self.apple_push_enabled {
            return Err(LexError::Parse("unknown command XAPPLEPUSHSERVICE".into()));
        }
        if name != "XAPPLEPUSHSERVICE" && !KNOWN_COMMANDS.contains(&name.as_str()) {
            return Err(LexError::Parse(format!("unknown command {}", name)));
        }
        if !mode.allows(&name) {
            return Err(LexError::Parse(format!("bad mode for command {}", name)));
        }

        let body = match name.as_str() {
            "CAPABILITY" => CommandBody::Capability,
            "NOOP" => CommandBody::Noop,
            "LOGOUT" => CommandBody::Logout,
            "CHECK" => CommandBody::Check,
            "IDLE" => CommandBody::Idle,
            "CLOSE" => CommandBody::Close,
            "ID" => self.id().await?,
            "COMPRESS" => self.compress().await?,
            "LOGIN" => self.login().await?,
            "AUTHENTICATE" => self.authenticate().await?,
            "ENABLE" => self.enable().await?,
            "SELECT" => self.select_examine(false).await?,
            "EXAMINE" => self.select_examine(true).await?,
            "CREATE" => CommandBody::Create {
                mailbox: self.mailbox().await?,
            },
            "DELETE" => CommandBody::Delete {
                mailbox: self.mailbox().await?,
            },
            "SUBSCRIBE" => CommandBody::Subscribe {
                mailbox: self.mailbox().await?,
            },
            "UNSUBSCRIBE" => CommandBody::Unsubscribe {
                mailbox: self.mailbox().await?,
            },
            "RENAME" => CommandBody::Rename {
                from: self.mailbox().await?,
                to: self.mailbox().await?,
            },
            "LIST" => self.list().await?,
            "LSUB" => CommandBody::Lsub {
                reference: self.mailbox_or_empty().await?,
                pattern: self.list_pattern().await?,
            },
            "STATUS" => self.status().await?,
            "APPEND" => self.append().await?,
            "EXPUNGE" => {
                if uid {
                    CommandBody::Expunge {
                        uid_seqs: Some(self.sequences().await?),
                    }
                } else {
                    CommandBody::Expunge { uid_seqs: None }
                }
            }
            "SEARCH" => self.search().await?,
            "FETCH" => self.fetch(uid).await?,
            "STORE" => self.store().await?,
            "COPY" => CommandBody::Copy {
                seqs: self.sequences().await?,
                mailbox: self.mailbox().await?,
            },
            "MOVE" => CommandBody::Move {
                seqs: self.sequences().await?,
                mailbox: self.mailbox().await?,
            },
            "XAPPLEPUSHSERVICE" => self.apple_push().await?,
            _ => unreachable!("name was checked against KNOWN_COMMANDS"),
        };

        // AUTHENTICATE consumes its own line end (the credential follows it).
        if name != "AUTHENTICATE" {
            self.lx.end().await?;
        }
        Ok(Command {
            tag: tag.to_string(),
            uid,
            body,
        })
    }

    // ---- token helpers ----

    async fn atom(&mut self) -> Result<String, LexError> {
        match self.lx.next(Expect::Atom).await? {
            Token::Atom(a) => Ok(a),
            _ => unreachable!(),
        }
    }

    async fn astring(&mut self) -> Result<Vec<u8>, LexError> {
        match self.lx.next(Expect::String).await? {
            Token::Str(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    async fn string_utf8(&mut self) -> Result<String, LexError> {
        String::from_utf8(self.astring().await?)
            .map_err(|_| LexError::Parse("string is not valid UTF-8".into()))
    }

    async fn number(&mut self) -> Result<u64, LexError> {
        match self.lx.next(Expect::Number).await? {
            Token::Number(n) => Ok(n),
            _ => unreachable!(),
        }
    }

    async fn number_u32(&mut self) -> Result<u32, LexError> {
        u32::try_from(self.number().await?).map_err(|_| LexError::Parse("number too large".into()))
    }

    async fn sequences(&mut self) -> Result<SequenceSet, LexError> {
        match self.lx.next(Expect::Sequences).await? {
            Token::Sequences(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    async fn mailbox(&mut self) -> Result<String, LexError> {
        let raw = self.astring().await?;
        utf7::decode_mailbox_name(&raw)
            .map_err(|e| LexError::Parse(format!("bad mailbox name: {}", e)))
    }

    /// LIST/LSUB reference slot: may be the empty quoted string.
    async fn mailbox_or_empty(&mut self) -> Result<String, LexError> {
        let raw = self.astring().await?;
        if raw.is_empty() {
            return Ok(String::new());
        }
        utf7::decode_mailbox_name(&raw)
            .map_err(|e| LexError::Parse(format!("bad mailbox name: {}", e)))
    }

    async fn list_pattern(&mut self) -> Result<String, LexError> {
        match self.lx.next(Expect::ListMailbox).await? {
            Token::Str(raw) => utf7::decode(&raw)
                .map_err(|e| LexError::Parse(format!("bad mailbox pattern: {}", e))),
            _ => unreachable!(),
        }
    }

    async fn flag(&mut self) -> Result<Flag, LexError> {
        match self.lx.next(Expect::Flag).await? {
            Token::Flag(f) => Ok(f),
            _ => unreachable!(),
        }
    }

    async fn flag_list(&mut self) -> Result<Vec<Flag>, LexError> {
        self.lx.next(Expect::ListStart).await?;
        let mut flags = Vec::new();
        while !self.lx.eat_char(')').await? {
            flags.push(self.flag().await?);
        }
        Ok(flags)
    }

    // ---- per-command sub-grammars ----

    async fn compress(&mut self) -> Result<CommandBody, LexError> {
        let alg = self.atom().await?.to_ascii_uppercase();
        if alg != "DEFLATE" {
            return Err(LexError::Parse(format!(
                "unknown compression algorithm {}",
                alg
            )));
        }
        Ok(CommandBody::Compress)
    }

    async fn login(&mut self) -> Result<CommandBody, LexError> {
        Ok(CommandBody::Login {
            username: self.string_utf8().await?,
            password: self.string_utf8().await?,
        })
    }

    /// AUTHENTICATE PLAIN with or without an initial response; the empty
    /// continuation `+\r\n` goes out before the credential line is read.
    async fn authenticate(&mut self) -> Result<CommandBody, LexError> {
        let mech = self.atom().await?.to_ascii_uppercase();
        if mech != "PLAIN" {
            return Err(LexError::Parse(format!(
                "unsupported authentication mechanism {}",
                mech
            )));
        }
        let blob = match self.lx.next_or_end(Expect::String).await? {
            Some(Token::Str(b)) => {
                self.lx.end().await?;
                b
            }
            Some(_) => unreachable!(),
            None => {
                self.lx.send_continuation("+\r\n").await?;
                let line = self.lx.read_line().await?;
                if line == "*" {
                    return Err(LexError::Parse("authentication aborted".into()));
                }
                line.into_bytes()
            }
        };
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&blob)
            .map_err(|_| LexError::Parse("bad base64 in credentials".into()))?;
        // PLAIN: authzid NUL authcid NUL password
        let mut parts = decoded.split(|&b| b == 0);
        let (_authzid, authcid, password) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(LexError::Parse("bad PLAIN credentials".into())),
        };
        Ok(CommandBody::Authenticate {
            username: String::from_utf8(authcid.to_vec())
                .map_err(|_| LexError::Parse("bad PLAIN credentials".into()))?,
            password: String::from_utf8(password.to_vec())
                .map_err(|_| LexError::Parse("bad PLAIN credentials".into()))?,
        })
    }

    async fn enable(&mut self) -> Result<CommandBody, LexError> {
        let mut capabilities = Vec::new();
        while !matches!(self.lx.peek_char().await?, Some('\r') | Some('\n')) {
            capabilities.push(self.atom().await?.to_ascii_uppercase());
        }
        if capabilities.is_empty() {
            return Err(LexError::Parse("ENABLE requires a capability".into()));
        }
        Ok(CommandBody::Enable { capabilities })
    }

    async fn select_examine(&mut self, examine: bool) -> Result<CommandBody, LexError> {
        let mailbox = self.mailbox().await?;
        let mut condstore = false;
        let mut qresync = None;
        if self.lx.eat_char('(').await? {
            while !self.lx.eat_char(')').await? {
                let opt = self.atom().await?.to_ascii_uppercase();
                match opt.as_str() {
                    "CONDSTORE" => condstore = true,
                    "QRESYNC" => qresync = Some(self.qresync_params().await?),
                    _ => {
                        return Err(LexError::Parse(format!("unknown select parameter {}", opt)))
                    }
                }
            }
        }
        Ok(if examine {
            CommandBody::Examine {
                mailbox,
                condstore,
                qresync,
            }
        } else {
            CommandBody::Select {
                mailbox,
                condstore,
                qresync,
            }
        })
    }

    /// `QRESYNC (uidvalidity modseq [known-uids [(known-seqs known-uids)]])`
    async fn qresync_params(&mut self) -> Result<QresyncParams, LexError> {
        self.lx.next(Expect::ListStart).await?;
        let uid_validity = self.number_u32().await?;
        if uid_validity == 0 {
            return Err(LexError::Parse("QRESYNC UIDVALIDITY cannot be 0".into()));
        }
        let mod_seq = self.number().await?;
        let mut known_uids = None;
        let mut seq_match = None;
        if matches!(self.lx.peek_char().await?, Some('0'..='9') | Some('*')) {
            known_uids = Some(self.sequences().await?);
        }
        if self.lx.eat_char('(').await? {
            let seqs = self.sequences().await?;
            let uids = self.sequences().await?;
            self.lx.next(Expect::ListEnd).await?;
            seq_match = Some((seqs, uids));
        }
        self.lx.next(Expect::ListEnd).await?;
        let star = known_uids.as_ref().map(SequenceSet::contains_star) == Some(true)
            || seq_match
                .as_ref()
                .map(|(a, b)| a.contains_star() || b.contains_star())
                == Some(true);
        if star {
            return Err(LexError::Parse("* not allowed in QRESYNC sets".into()));
        }
        Ok(QresyncParams {
            uid_validity,
            mod_seq,
            known_uids,
            seq_match,
        })
    }

    async fn list(&mut self) -> Result<CommandBody, LexError> {
        let mut select_opts = Vec::new();
        if self.lx.eat_char('(').await? {
            while !self.lx.eat_char(')').await? {
                let opt = self.atom().await?.to_ascii_uppercase();
                select_opts.push(match opt.as_str() {
                    "SUBSCRIBED" => ListSelectOpt::Subscribed,
                    "REMOTE" => ListSelectOpt::Remote,
                    "RECURSIVEMATCH" => ListSelectOpt::RecursiveMatch,
                    "SPECIAL-USE" => ListSelectOpt::SpecialUse,
                    _ => return Err(LexError::Parse(format!("unknown list option {}", opt))),
                });
            }
        }
        let reference = self.mailbox_or_empty().await?;
        let pattern = self.list_pattern().await?;
        let mut return_opts = Vec::new();
        if !matches!(self.lx.peek_char().await?, Some('\r') | Some('\n')) {
            let kw = self.atom().await?.to_ascii_uppercase();
            if kw != "RETURN" {
                return Err(LexError::Parse(format!("unexpected {} after LIST", kw)));
            }
            self.lx.next(Expect::ListStart).await?;
            while !self.lx.eat_char(')').await? {
                let opt = self.atom().await?.to_ascii_uppercase();
                return_opts.push(match opt.as_str() {
                    "SUBSCRIBED" => ListReturnOpt::Subscribed,
                    "CHILDREN" => ListReturnOpt::Children,
                    "SPECIAL-USE" => ListReturnOpt::SpecialUse,
                    _ => {
                        return Err(LexError::Parse(format!(
                            "unknown list return option {}",
                            opt
                        )))
                    }
                });
            }
        }
        Ok(CommandBody::List {
            select_opts,
            reference,
            pattern,
            return_opts,
        })
    }

    async fn status(&mut self) -> Result<CommandBody, LexError> {
        let mailbox = self.mailbox().await?;
        self.lx.next(Expect::ListStart).await?;
        let mut items = Vec::new();
        while !self.lx.eat_char(')').await? {
            let item = self.atom().await?.to_ascii_uppercase();
            items.push(match item.as_str() {
                "MESSAGES" => StatusItem::Messages,
                "RECENT" => StatusItem::Recent,
                "UIDNEXT" => StatusItem::UidNext,
                "UIDVALIDITY" => StatusItem::UidValidity,
                "UNSEEN" => StatusItem::Unseen,
                "HIGHESTMODSEQ" => StatusItem::HighestModSeq,
                _ => return Err(LexError::Parse(format!("unknown status item {}", item))),
            });
        }
        if items.is_empty() {
            return Err(LexError::Parse("empty status item list".into()));
        }
        Ok(CommandBody::Status { mailbox, items })
    }

    async fn append(&mut self) -> Result<CommandBody, LexError> {
        let mailbox = self.mailbox().await?;
        let mut flags = Vec::new();
        if matches!(self.lx.peek_char().await?, Some('(')) {
            flags = self.flag_list().await?;
        }
        let mut date = None;
        if matches!(self.lx.peek_char().await?, Some('"')) {
            let raw = self.string_utf8().await?;
            date = Some(
                parse_date_time(&raw)
                    .ok_or_else(|| LexError::Parse(format!("bad date-time {:?}", raw)))?,
            );
        }
        let message = match self.lx.next(Expect::Literal).await? {
            Token::Literal(m) => m,
            _ => unreachable!(),
        };
        Ok(CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        })
    }

    async fn fetch(&mut self, uid: bool) -> Result<CommandBody, LexError> {
        let seqs = self.sequences().await?;
        let mut items = Vec::new();
        if self.lx.eat_char('(').await? {
            loop {
                match self.lx.next(Expect::FetchItem).await? {
                    Token::FetchItem(fi) => items.push(fi),
                    Token::FetchMacro(_) => {
                        return Err(LexError::Parse(
                            "fetch macros are only valid as the sole item".into(),
                        ))
                    }
                    _ => unreachable!(),
                }
                if self.lx.eat_char(')').await? {
                    break;
                }
            }
        } else {
            match self.lx.next(Expect::FetchItem).await? {
                Token::FetchItem(fi) => items.push(fi),
                Token::FetchMacro(m) => items = m.expand(),
                _ => unreachable!(),
            }
        }
        if uid && !items.iter().any(|i| i.item == FetchItemType::Uid) {
            items.push(FetchItem::of(FetchItemType::Uid));
        }
        let mut changed_since = None;
        let mut vanished = false;
        if self.lx.eat_char('(').await? {
            while !self.lx.eat_char(')').await? {
                let modifier = self.atom().await?.to_ascii_uppercase();
                match modifier.as_str() {
                    "CHANGEDSINCE" => changed_since = Some(self.number().await?),
                    "VANISHED" if uid => vanished = true,
                    "VANISHED" => {
                        return Err(LexError::Parse("VANISHED requires UID FETCH".into()))
                    }
                    _ => {
                        return Err(LexError::Parse(format!(
                            "unknown fetch modifier {}",
                            modifier
                        )))
                    }
                }
            }
            if changed_since.is_none() {
                return Err(LexError::Parse("fetch modifiers require CHANGEDSINCE".into()));
            }
        }
        Ok(CommandBody::Fetch {
            seqs,
            items,
            changed_since,
            vanished,
        })
    }

    async fn store(&mut self) -> Result<CommandBody, LexError> {
        let seqs = self.sequences().await?;
        let mut unchanged_since = None;
        if self.lx.eat_char('(').await? {
            let modifier = self.atom().await?.to_ascii_uppercase();
            if modifier != "UNCHANGEDSINCE" {
                return Err(LexError::Parse(format!(
                    "unknown store modifier {}",
                    modifier
                )));
            }
            unchanged_since = Some(self.number().await?);
            self.lx.next(Expect::ListEnd).await?;
        }
        let mode_atom = self.atom().await?.to_ascii_uppercase();
        let (mode_name, silent) = match mode_atom.strip_suffix(".SILENT") {
            Some(base) => (base.to_string(), true),
            None => (mode_atom, false),
        };
        let mode = match mode_name.as_str() {
            "FLAGS" => StoreMode::Replace,
            "+FLAGS" => StoreMode::Add,
            "-FLAGS" => StoreMode::Remove,
            _ => return Err(LexError::Parse(format!("bad store mode {}", mode_name))),
        };
        let mut flags = Vec::new();
        if matches!(self.lx.peek_char().await?, Some('(')) {
            flags = self.flag_list().await?;
        } else {
            while !matches!(self.lx.peek_char().await?, Some('\r') | Some('\n')) {
                flags.push(self.flag().await?);
            }
        }
        Ok(CommandBody::Store {
            seqs,
            action: StoreAction {
                mode,
                silent,
                flags,
                unchanged_since,
            },
        })
    }

    async fn search(&mut self) -> Result<CommandBody, LexError> {
        let mut return_opts = Vec::new();
        let mut keys = Vec::new();
        loop {
            if matches!(self.lx.peek_char().await?, Some('\r') | Some('\n')) {
                break;
            }
            if keys.is_empty() && matches!(self.lx.peek_char().await?, Some(c) if c.is_ascii_alphabetic())
            {
                // RETURN and CHARSET are only recognized before the first key.
                let save = self.lx.next(Expect::SearchKey).await?;
                let kw = match &save {
                    Token::Atom(a) => a.to_ascii_uppercase(),
                    _ => String::new(),
                };
                match kw.as_str() {
                    "RETURN" => {
                        self.lx.next(Expect::ListStart).await?;
                        while !self.lx.eat_char(')').await? {
                            let opt = self.atom().await?.to_ascii_uppercase();
                            return_opts.push(match opt.as_str() {
                                "MIN" => SearchReturnOpt::Min,
                                "MAX" => SearchReturnOpt::Max,
                                "ALL" => SearchReturnOpt::All,
                                "COUNT" => SearchReturnOpt::Count,
                                _ => {
                                    return Err(LexError::Parse(format!(
                                        "unknown search return option {}",
                                        opt
                                    )))
                                }
                            });
                        }
                        if return_opts.is_empty() {
                            return_opts.push(SearchReturnOpt::All);
                        }
                        continue;
                    }
                    "CHARSET" => {
                        let cs = self.string_utf8().await?.to_ascii_uppercase();
                        if cs != "UTF-8" && cs != "US-ASCII" {
                            return Err(LexError::Parse(format!("unsupported charset {}", cs)));
                        }
                        continue;
                    }
                    _ => keys.push(self.search_key_from(save).await?),
                }
            } else {
                let tok = self.lx.next(Expect::SearchKey).await?;
                keys.push(self.search_key_from(tok).await?);
            }
        }
        let op = match keys.len() {
            0 => return Err(LexError::Parse("empty search program".into())),
            1 => keys.pop().expect("one element"),
            _ => SearchOp::And(keys),
        };
        Ok(CommandBody::Search { return_opts, op })
    }

    fn search_key(&mut self) -> BoxFuture<'_, Result<SearchOp, LexError>> {
        async move {
            let tok = self.lx.next(Expect::SearchKey).await?;
            self.search_key_from(tok).await
        }
        .boxed()
    }

    fn search_key_from(&mut self, tok: Token) -> BoxFuture<'_, Result<SearchOp, LexError>> {
        async move {
            match tok {
                Token::Sequences(set) => Ok(SearchOp::SeqSet(set)),
                Token::ListStart => {
                    // Parenthesized list: implicit AND.
                    let mut kids = Vec::new();
                    loop {
                        let tok = self.lx.next(Expect::SearchKey).await?;
                        if matches!(tok, Token::ListEnd) {
                            break;
                        }
                        kids.push(self.search_key_from(tok).await?);
                    }
                    match kids.len() {
                        0 => Err(LexError::Parse("empty search list".into())),
                        1 => Ok(kids.pop().expect("one element")),
                        _ => Ok(SearchOp::And(kids)),
                    }
                }
                Token::ListEnd => Err(LexError::Parse("unbalanced parenthesis".into())),
                Token::Atom(a) => self.search_leaf(&a.to_ascii_uppercase()).await,
                _ => unreachable!("Expect::SearchKey yields seqs, parens or atoms"),
            }
        }
        .boxed()
    }

    async fn search_leaf(&mut self, key: &str) -> Result<SearchOp, LexError> {
        let op = match key {
            "ALL" => SearchOp::All,
            "ANSWERED" => SearchOp::Answered,
            "DELETED" => SearchOp::Deleted,
            "DRAFT" => SearchOp::Draft,
            "FLAGGED" => SearchOp::Flagged,
            "NEW" => SearchOp::New,
            "OLD" => SearchOp::Old,
            "RECENT" => SearchOp::Recent,
            "SEEN" => SearchOp::Seen,
            "UNANSWERED" => SearchOp::Unanswered,
            "UNDELETED" => SearchOp::Undeleted,
            "UNDRAFT" => SearchOp::Undraft,
            "UNFLAGGED" => SearchOp::Unflagged,
            "UNSEEN" => SearchOp::Unseen,
            "KEYWORD" => SearchOp::Keyword(self.atom().await?),
            "UNKEYWORD" => SearchOp::Unkeyword(self.atom().await?),
            "UID" => SearchOp::Uid(self.sequences().await?),
            "BCC" => SearchOp::Bcc(self.string_utf8().await?),
            "BODY" => SearchOp::Body(self.string_utf8().await?),
            "CC" => SearchOp::Cc(self.string_utf8().await?),
            "FROM" => SearchOp::From(self.string_utf8().await?),
            "SUBJECT" => SearchOp::Subject(self.string_utf8().await?),
            "TEXT" => SearchOp::Text(self.string_utf8().await?),
            "TO" => SearchOp::To(self.string_utf8().await?),
            "HEADER" => {
                let field = self.string_utf8().await?;
                let value = self.string_utf8().await?;
                SearchOp::Header(field, value)
            }
            "BEFORE" => SearchOp::Before(self.date().await?),
            "ON" => SearchOp::On(self.date().await?),
            "SINCE" => SearchOp::Since(self.date().await?),
            "SENTBEFORE" => SearchOp::SentBefore(self.date().await?),
            "SENTON" => SearchOp::SentOn(self.date().await?),
            "SENTSINCE" => SearchOp::SentSince(self.date().await?),
            "LARGER" => SearchOp::Larger(self.number_u32().await?),
            "SMALLER" => SearchOp::Smaller(self.number_u32().await?),
            "MODSEQ" => {
                // RFC 7162 allows an entry-name/entry-type prefix; parsed and
                // discarded.
                if matches!(self.lx.peek_char().await?, Some('"')) {
                    let _entry_name = self.astring().await?;
                    let _entry_type = self.atom().await?;
                }
                SearchOp::ModSeq(self.number().await?)
            }
            "NOT" => SearchOp::Not(Box::new(self.search_key().await?)),
            "OR" => {
                let a = self.search_key().await?;
                let b = self.search_key().await?;
                SearchOp::Or(Box::new(a), Box::new(b))
            }
            _ => return Err(LexError::Parse(format!("unknown search key {}", key))),
        };
        Ok(op)
    }

    async fn date(&mut self) -> Result<chrono::DateTime<chrono::Utc>, LexError> {
        match self.lx.next(Expect::Date).await? {
            Token::Date(d) => Ok(d),
            _ => unreachable!(),
        }
    }

    async fn id(&mut self) -> Result<CommandBody, LexError> {
        match self.lx.next(Expect::Unknown).await? {
            Token::Atom(a) if a.eq_ignore_ascii_case("NIL") => Ok(CommandBody::Id(Vec::new())),
            Token::ListStart => {
                let mut fields = Vec::new();
                let mut tokens = 0usize;
                loop {
                    let key = match self.lx.next(Expect::Unknown).await? {
                        Token::ListEnd => break,
                        Token::Str(s) => String::from_utf8_lossy(&s).into_owned(),
                        Token::Atom(a) => a,
                        _ => return Err(LexError::Parse("bad ID field name".into())),
                    };
                    let value = match self.lx.next(Expect::Unknown).await? {
                        Token::Atom(a) if a.eq_ignore_ascii_case("NIL") => None,
                        Token::Str(s) => Some(String::from_utf8_lossy(&s).into_owned()),
                        Token::Atom(a) => Some(a),
                        _ => return Err(LexError::Parse("bad ID field value".into())),
                    };
                    tokens += 2;
                    if tokens > 100 {
                        return Err(LexError::Parse("too many ID fields".into()));
                    }
                    fields.push((key, value));
                }
                Ok(CommandBody::Id(fields))
            }
            _ => Err(LexError::Parse("ID requires NIL or a field list".into())),
        }
    }

    /// Free-order key/value pairs: `mailboxes`, `aps-version`,
    /// `aps-account-id`, `aps-device-token`, `aps-subtopic`.
    async fn apple_push(&mut self) -> Result<CommandBody, LexError> {
        let mut params = ApplePushParams::default();
        while !matches!(self.lx.peek_char().await?, Some('\r') | Some('\n')) {
            let key = self.atom().await?.to_ascii_lowercase();
            match key.as_str() {
                "aps-version" => params.version = self.number_u32().await?,
                "aps-account-id" => params.account_id = self.string_utf8().await?,
                "aps-device-token" => params.device_token = self.string_utf8().await?,
                "aps-subtopic" => params.subtopic = self.string_utf8().await?,
                "mailboxes" => {
                    self.lx.next(Expect::ListStart).await?;
                    while !self.lx.eat_char(')').await? {
                        let raw = self.astring().await?;
                        let name = utf7::decode_mailbox_name(&raw)
                            .map_err(|e| LexError::Parse(format!("bad mailbox name: {}", e)))?;
                        params.mailboxes.push(name);
                    }
                }
                _ => {
                    return Err(LexError::Parse(format!(
                        "unknown XAPPLEPUSHSERVICE key {}",
                        key
                    )))
                }
            }
        }
        Ok(CommandBody::XApplePushService(params))
    }
}
