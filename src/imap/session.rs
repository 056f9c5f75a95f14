//! Per-connection session engine.
//!
//! The connection task owns the read half (source, lexer, parser) and drives
//! parse, dispatch, respond. The write half lives behind a mutex shared with
//! the notifier, so unsolicited EXISTS/EXPUNGE lines interleave with command
//! responses at line granularity. Queued updates drain at the flush points:
//! before a command's responses, and immediately while the session idles.

use std::io::Cursor;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

use super::capability::ServerCapability;
use super::flow::Mode;
use super::lexer::{ContinuationSink, Lexer};
use super::notify::{coalesce, IdleUpdate, Notifier};
use super::parser::{ParseError, Parser};
use super::response;
use super::source::Source;
use super::types::{Command, CommandBody};
use crate::storage::{Mailbox, MailboxId, Store, StoreError, StoreSession, UserId};

pub type Reader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type Writer = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// The guarded write half plus the update queue and idle flags it protects.
pub struct Outbound {
    w: BufWriter<Writer>,
    updates: Vec<IdleUpdate>,
    pub idling: bool,
    pub idle_started: bool,
}

impl Outbound {
    pub async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.w.write_all(line).await
    }

    /// Flush buffered output; while DEFLATE is active this also emits a
    /// compressor sync flush so the client sees the bytes now.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.w.flush().await
    }

    pub async fn flush_updates(&mut self) -> std::io::Result<()> {
        if self.updates.is_empty() {
            return Ok(());
        }
        for update in coalesce(std::mem::take(&mut self.updates)) {
            let line = match update {
                IdleUpdate::Exists(n) => response::Line::untagged()
                    .number(n as u64)
                    .raw(" EXISTS")
                    .finish(),
                IdleUpdate::Expunge(n) => response::Line::untagged()
                    .number(n as u64)
                    .raw(" EXPUNGE")
                    .finish(),
            };
            self.w.write_all(&line).await?;
        }
        self.flush().await
    }
}

/// State reachable from other tasks: the notifier walks sessions through
/// this. Lock order: user entry, then `out`; `selected` is a leaf lock.
pub struct SessionShared {
    id: String,
    selected: StdMutex<Option<(MailboxId, Arc<dyn Mailbox>)>>,
    pub out: Mutex<Outbound>,
}

impl SessionShared {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn selected_mailbox(&self) -> Option<(MailboxId, Arc<dyn Mailbox>)> {
        self.selected.lock().expect("selected lock").clone()
    }

    pub fn set_selected(&self, sel: Option<(MailboxId, Arc<dyn Mailbox>)>) {
        *self.selected.lock().expect("selected lock") = sel;
    }

    /// Queue an unsolicited update; delivered immediately when the session
    /// is in its IDLE wait, otherwise at its next flush point.
    pub async fn enqueue_update(&self, update: IdleUpdate) {
        let mut out = self.out.lock().await;
        if !out.idle_started {
            return;
        }
        out.updates.push(update);
        if out.idling {
            if let Err(e) = out.flush_updates().await {
                tracing::debug!(session = %self.id, error = %e, "idle.flush");
            }
        }
    }
}

/// Lets the lexer flush `+` continuations through the guarded writer.
struct SharedSink(Arc<SessionShared>);

#[async_trait]
impl ContinuationSink for SharedSink {
    async fn continuation(&mut self, text: &str, _octets: u64) -> std::io::Result<()> {
        let mut out = self.0.out.lock().await;
        out.write_line(text.as_bytes()).await?;
        out.flush().await
    }
}

pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
    parser: Option<Parser<Reader>>,
    pub(crate) mode: Mode,
    pub(crate) user_id: Option<UserId>,
    pub(crate) store_session: Option<Box<dyn StoreSession>>,
    pub(crate) selected_name: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) condstore: bool,
    pub(crate) caps: ServerCapability,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) string_max: usize,
    pub(crate) literal_max: usize,
    compress_pending: bool,
    compressed: bool,
    logout: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Reader,
        writer: Writer,
        store: Arc<dyn Store>,
        notifier: Arc<Notifier>,
        caps: ServerCapability,
        string_max: usize,
        literal_max: usize,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            id: session_id(),
            selected: StdMutex::new(None),
            out: Mutex::new(Outbound {
                w: BufWriter::new(writer),
                updates: Vec::new(),
                idling: false,
                idle_started: false,
            }),
        });
        let mut lexer = Lexer::new(Source::new(reader));
        lexer.string_max = string_max;
        lexer.literal_max = literal_max;
        lexer.set_sink(Box::new(SharedSink(shared.clone())));
        let mut parser = Parser::new(lexer);
        parser.apple_push_enabled = caps.apple_push;
        Self {
            shared,
            parser: Some(parser),
            mode: Mode::NonAuth,
            user_id: None,
            store_session: None,
            selected_name: None,
            read_only: false,
            condstore: false,
            caps,
            store,
            notifier,
            string_max,
            literal_max,
            compress_pending: false,
            compressed: false,
            logout: false,
        }
    }

    pub fn id(&self) -> String {
        self.shared.id.clone()
    }

    /// Drive the session until LOGOUT or connection loss.
    pub async fn run(mut self) {
        let session = self.shared.id.clone();
        if let Err(e) = self.greet().await {
            tracing::debug!(%session, error = %e, "session.greeting");
            self.cleanup().await;
            return;
        }
        loop {
            let cmd = match self
                .parser
                .as_mut()
                .expect("parser present outside transport swap")
                .read_command(self.mode)
                .await
            {
                Ok(cmd) => cmd,
                Err(ParseError::Tagged { tag, msg }) => {
                    if self.report_parse_error(Some(&tag), &msg).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(ParseError::Untagged(msg)) => {
                    if self.report_parse_error(None, &msg).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(ParseError::Fatal(e)) => {
                    tracing::debug!(%session, error = %e, "session.read");
                    break;
                }
            };

            tracing::debug!(%session, tag = %cmd.tag, command = cmd.name(), "imap.command");

            // Flush point: updates queued since the previous command go out
            // before this command's own responses.
            if self.drain_updates().await.is_err() {
                break;
            }

            let dispatched = std::panic::AssertUnwindSafe(self.dispatch(&cmd))
                .catch_unwind()
                .await;
            match dispatched {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    tracing::debug!(%session, error = %e, "session.io");
                    break;
                }
                Err(panic) => {
                    let what = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(%session, panic = %what, command = cmd.name(), "handler.panic");
                    break;
                }
            }

            if self.compress_pending {
                self.compress_pending = false;
                if let Err(e) = self.swap_transport().await {
                    tracing::debug!(%session, error = %e, "compress.swap");
                    break;
                }
            }
            if self.logout {
                break;
            }
        }
        self.cleanup().await;
        tracing::debug!(%session, "session.close");
    }

    async fn greet(&mut self) -> Result<()> {
        let line = response::Line::untagged()
            .raw("OK [CAPABILITY ")
            .raw(&self.caps.listing(Mode::NonAuth))
            .raw("] postillon ready")
            .finish();
        self.send_flush(line).await
    }

    async fn report_parse_error(&mut self, tag: Option<&str>, msg: &str) -> Result<()> {
        let line = match tag {
            Some(tag) => response::bad(tag, msg),
            None => response::untagged_bad(msg),
        };
        self.send_flush(line).await
    }

    async fn dispatch(&mut self, cmd: &Command) -> Result<()> {
        let tag = cmd.tag.as_str();
        match &cmd.body {
            CommandBody::Capability => self.cmd_capability(tag).await,
            CommandBody::Noop => self.cmd_noop(tag).await,
            CommandBody::Check => self.cmd_check(tag).await,
            CommandBody::Logout => self.cmd_logout(tag).await,
            CommandBody::Id(fields) => self.cmd_id(tag, fields).await,
            CommandBody::Compress => self.cmd_compress(tag).await,
            CommandBody::Login { username, password } => {
                self.cmd_login(tag, username, password).await
            }
            CommandBody::Authenticate { username, password } => {
                self.cmd_login(tag, username, password).await
            }
            CommandBody::Enable { capabilities } => self.cmd_enable(tag, capabilities).await,
            CommandBody::Select {
                mailbox,
                condstore,
                qresync,
            } => {
                self.cmd_select(tag, mailbox, *condstore, qresync.as_ref(), false)
                    .await
            }
            CommandBody::Examine {
                mailbox,
                condstore,
                qresync,
            } => {
                self.cmd_select(tag, mailbox, *condstore, qresync.as_ref(), true)
                    .await
            }
            CommandBody::Create { mailbox } => self.cmd_create(tag, mailbox).await,
            CommandBody::Delete { mailbox } => self.cmd_delete(tag, mailbox).await,
            CommandBody::Rename { from, to } => self.cmd_rename(tag, from, to).await,
            CommandBody::Subscribe { mailbox } => self.cmd_subscribe(tag, mailbox, true).await,
            CommandBody::Unsubscribe { mailbox } => self.cmd_subscribe(tag, mailbox, false).await,
            CommandBody::List {
                select_opts,
                reference,
                pattern,
                return_opts,
            } => {
                self.cmd_list(tag, select_opts, reference, pattern, return_opts, false)
                    .await
            }
            CommandBody::Lsub { reference, pattern } => {
                self.cmd_list(tag, &[], reference, pattern, &[], true).await
            }
            CommandBody::Status { mailbox, items } => self.cmd_status(tag, mailbox, items).await,
            CommandBody::Append {
                mailbox,
                flags,
                date,
                message,
            } => self.cmd_append(tag, mailbox, flags, *date, message).await,
            CommandBody::Idle => self.cmd_idle(tag).await,
            CommandBody::Close => self.cmd_close(tag).await,
            CommandBody::Expunge { uid_seqs } => self.cmd_expunge(tag, uid_seqs.as_ref()).await,
            CommandBody::Search { return_opts, op } => {
                self.cmd_search(tag, cmd.uid, return_opts, op).await
            }
            CommandBody::Fetch {
                seqs,
                items,
                changed_since,
                vanished: _,
            } => {
                self.cmd_fetch(tag, cmd.uid, seqs, items, *changed_since)
                    .await
            }
            CommandBody::Store { seqs, action } => {
                self.cmd_store(tag, cmd.uid, seqs, action).await
            }
            CommandBody::Copy { seqs, mailbox } => {
                self.cmd_copy_move(tag, cmd.uid, seqs, mailbox, false).await
            }
            CommandBody::Move { seqs, mailbox } => {
                self.cmd_copy_move(tag, cmd.uid, seqs, mailbox, true).await
            }
            CommandBody::XApplePushService(params) => self.cmd_apple_push(tag, params).await,
        }
    }

    // ---- write helpers used by the command handlers ----

    pub(crate) async fn send(&self, line: Vec<u8>) -> Result<()> {
        let mut out = self.shared.out.lock().await;
        out.write_line(&line).await.context("write")
    }

    pub(crate) async fn send_flush(&self, line: Vec<u8>) -> Result<()> {
        let mut out = self.shared.out.lock().await;
        out.write_line(&line).await.context("write")?;
        out.flush().await.context("flush")
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.shared.out.lock().await.flush().await.context("flush")
    }

    pub(crate) async fn drain_updates(&self) -> Result<()> {
        let mut out = self.shared.out.lock().await;
        out.flush_updates().await.context("flush updates")
    }

    pub(crate) fn store_session(&self) -> &dyn StoreSession {
        self.store_session
            .as_deref()
            .expect("authenticated mode has a store session")
    }

    pub(crate) fn selected(&self) -> (MailboxId, Arc<dyn Mailbox>) {
        self.shared
            .selected_mailbox()
            .expect("selected mode has a mailbox")
    }

    /// Fan an update out to this user's sessions observing `mailbox_id`.
    pub(crate) async fn notify_mailbox(
        &self,
        mailbox_id: MailboxId,
        update: IdleUpdate,
        skip_self: bool,
    ) {
        if let Some(user) = self.user_id {
            self.notifier
                .broadcast(user, mailbox_id, update, &self.shared.id, skip_self)
                .await;
        }
    }

    /// Wake any push devices registered for a mailbox.
    pub(crate) async fn push_wake(&self, mailbox_name: &str) {
        let devices = self.store_session().push_devices(mailbox_name).await;
        self.notifier.push_devices(devices);
    }

    /// Map a store error to its tagged response per the error taxonomy.
    pub(crate) async fn send_store_error(&self, tag: &str, err: StoreError) -> Result<()> {
        let line = match &err {
            StoreError::BadCredentials => response::no(tag, "bad credentials"),
            StoreError::NoSuchMailbox(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Rejected(_) => response::no(tag, &err.to_string()),
            StoreError::Internal(_) => response::bad(tag, &err.to_string()),
        };
        self.send_flush(line).await
    }

    /// First MODSEQ-touching command switches the session into CONDSTORE
    /// reporting; announce the current HIGHESTMODSEQ once, beforehand.
    pub(crate) async fn ensure_condstore(&mut self) -> Result<()> {
        if self.condstore {
            return Ok(());
        }
        self.condstore = true;
        if let Some((_, mbx)) = self.shared.selected_mailbox() {
            if let Ok(n) = mbx.highest_mod_seq().await {
                let line = response::Line::untagged()
                    .raw("OK [HIGHESTMODSEQ ")
                    .number(n)
                    .raw("] modseq tracking enabled")
                    .finish();
                self.send(line).await?;
            }
        }
        Ok(())
    }

    /// Give up the selected mailbox (CLOSE, reselect, logout).
    pub(crate) async fn deselect(&mut self) {
        if let Some((_, mbx)) = self.shared.selected_mailbox() {
            mbx.close().await;
        }
        self.shared.set_selected(None);
        self.selected_name = None;
        self.read_only = false;
        let mut out = self.shared.out.lock().await;
        out.idle_started = false;
        out.updates.clear();
    }

    pub(crate) fn request_compress_swap(&mut self) {
        self.compress_pending = true;
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// One-way transport swap to DEFLATE, after COMPRESS's tagged OK has been
    /// flushed. Bytes the source had buffered (pipelined compressed input)
    /// are replayed in front of the raw socket.
    async fn swap_transport(&mut self) -> Result<()> {
        let parser = self.parser.take().expect("parser present");
        let (leftover, reader) = parser.lx.into_source().into_parts();
        let chained: Reader = Box::new(Cursor::new(leftover).chain(reader));
        let decoder: Reader = Box::new(DeflateDecoder::new(BufReader::new(chained)));

        let mut lexer = Lexer::new(Source::new(decoder));
        lexer.string_max = self.string_max;
        lexer.literal_max = self.literal_max;
        lexer.set_sink(Box::new(SharedSink(self.shared.clone())));
        let mut parser = Parser::new(lexer);
        parser.apple_push_enabled = self.caps.apple_push;
        self.parser = Some(parser);

        let mut out = self.shared.out.lock().await;
        out.flush().await.context("pre-swap flush")?;
        let plain = std::mem::replace(
            &mut out.w,
            BufWriter::new(Box::new(tokio::io::sink()) as Writer),
        )
        .into_inner();
        let encoder: Writer = Box::new(DeflateEncoder::with_quality(
            plain,
            async_compression::Level::Fastest,
        ));
        out.w = BufWriter::new(encoder);
        drop(out);

        self.compressed = true;
        tracing::debug!(session = %self.shared.id, "compress.active");
        Ok(())
    }

    /// IDLE wait: one line, which must be DONE.
    pub(crate) async fn idle_wait(&mut self) -> Result<bool> {
        let line = self
            .parser
            .as_mut()
            .expect("parser present outside transport swap")
            .lx
            .read_line()
            .await
            .context("idle read")?;
        Ok(line.eq_ignore_ascii_case("DONE"))
    }

    async fn cleanup(&mut self) {
        self.deselect().await;
        if let Some(store_session) = self.store_session.take() {
            store_session.close().await;
        }
        if let Some(user_id) = self.user_id.take() {
            self.notifier
                .registry
                .detach(user_id, &self.shared.id)
                .await;
        }
        let _ = self.shared.out.lock().await.flush().await;
    }

    pub(crate) fn set_logout(&mut self) {
        self.logout = true;
    }
}

/// Random stable session identifier: 10 bytes, base32.
fn session_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let bytes: [u8; 10] = rand::random();
    let mut out = String::with_capacity(16);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for b in bytes {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 31) as usize] as char);
        }
    }
    out
}
