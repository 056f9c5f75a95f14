//! Commands that operate on the selected mailbox.

use anyhow::Result;

use super::flags_wire;
use crate::imap::flow::Mode;
use crate::imap::mail_view;
use crate::imap::notify::IdleUpdate;
use crate::imap::response::{self, Line};
use crate::imap::session::Session;
use crate::imap::types::{
    FetchItem, FetchItemType, SearchOp, SearchReturnOpt, Section, SectionName, SequenceSet,
    StoreAction, StoreMode,
};
use crate::storage::FetchedMessage;

impl Session {
    /// Checkpointing is a no-op for the store boundary.
    pub(crate) async fn cmd_check(&mut self, tag: &str) -> Result<()> {
        self.send_flush(response::ok(tag, "CHECK completed")).await
    }

    pub(crate) async fn cmd_close(&mut self, tag: &str) -> Result<()> {
        let (mbx_id, mbx) = self.selected();
        if !self.read_only {
            // Silent expunge: no untagged lines for this session, but the
            // user's other sessions hear about it.
            if let Ok(expunged) = mbx.expunge(None).await {
                for n in expunged {
                    self.notify_mailbox(mbx_id, IdleUpdate::Expunge(n), true).await;
                }
            }
        }
        self.deselect().await;
        self.mode = Mode::Auth;
        self.send_flush(response::ok(tag, "CLOSE completed")).await
    }

    pub(crate) async fn cmd_expunge(
        &mut self,
        tag: &str,
        uid_seqs: Option<&SequenceSet>,
    ) -> Result<()> {
        if self.read_only {
            return self
                .send_flush(response::no(tag, "mailbox is read-only"))
                .await;
        }
        let (mbx_id, mbx) = self.selected();
        let expunged = match mbx.expunge(uid_seqs).await {
            Ok(e) => e,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        for &n in &expunged {
            self.send(
                Line::untagged()
                    .number(n as u64)
                    .raw(" EXPUNGE")
                    .finish(),
            )
            .await?;
        }
        for &n in &expunged {
            self.notify_mailbox(mbx_id, IdleUpdate::Expunge(n), true).await;
        }
        self.send_flush(response::ok(tag, "EXPUNGE completed")).await
    }

    pub(crate) async fn cmd_search(
        &mut self,
        tag: &str,
        uid_mode: bool,
        return_opts: &[SearchReturnOpt],
        op: &SearchOp,
    ) -> Result<()> {
        let with_modseq = op.references_modseq();
        if with_modseq {
            self.ensure_condstore().await?;
        }
        let (_, mbx) = self.selected();
        let hits = match mbx.search(op, uid_mode).await {
            Ok(h) => h,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let nums: Vec<u32> = hits
            .iter()
            .map(|m| if uid_mode { m.uid } else { m.seq })
            .collect();

        if return_opts.is_empty() {
            let mut line = Line::untagged().raw("SEARCH");
            for &n in &nums {
                line = line.sp().number(n as u64);
            }
            if with_modseq && !hits.is_empty() {
                let max = hits.iter().map(|m| m.mod_seq).max().unwrap_or(0);
                line = line.raw(" (MODSEQ ").number(max).raw(")");
            }
            self.send(line.finish()).await?;
        } else {
            let mut line = Line::untagged()
                .raw("ESEARCH (TAG \"")
                .raw(tag)
                .raw("\")");
            if uid_mode {
                line = line.raw(" UID");
            }
            // Fixed parameter order: COUNT, MIN, MAX, ALL, MODSEQ.
            if return_opts.contains(&SearchReturnOpt::Count) {
                line = line.raw(" COUNT ").number(nums.len() as u64);
            }
            if return_opts.contains(&SearchReturnOpt::Min) && !nums.is_empty() {
                line = line.raw(" MIN ").number(nums[0] as u64);
            }
            if return_opts.contains(&SearchReturnOpt::Max) && !nums.is_empty() {
                line = line.raw(" MAX ").number(nums[nums.len() - 1] as u64);
            }
            if return_opts.contains(&SearchReturnOpt::All) && !nums.is_empty() {
                let set = SequenceSet::from_sorted(&nums);
                line = line.raw(" ALL ").raw(&set.to_string());
            }
            if with_modseq && !hits.is_empty() {
                let value = esearch_modseq(return_opts, &hits);
                line = line.raw(" MODSEQ ").number(value);
            }
            self.send(line.finish()).await?;
        }
        self.send_flush(response::ok(tag, "SEARCH completed")).await
    }

    pub(crate) async fn cmd_fetch(
        &mut self,
        tag: &str,
        uid_mode: bool,
        seqs: &SequenceSet,
        items: &[FetchItem],
        changed_since: Option<u64>,
    ) -> Result<()> {
        if changed_since.is_some() || items.iter().any(|i| i.item == FetchItemType::ModSeq) {
            self.ensure_condstore().await?;
        }
        let (_, mbx) = self.selected();
        let need_body = mail_view::items_need_body(items);
        let fetched = match mbx.fetch(uid_mode, seqs, changed_since, need_body).await {
            Ok(f) => f,
            Err(e) => return self.send_store_error(tag, e).await,
        };

        // Large BODY literals go last on the line; clients depend on the
        // metadata items arriving first.
        let mut ordered: Vec<&FetchItem> = items.iter().filter(|i| !i.is_body()).collect();
        ordered.extend(items.iter().filter(|i| i.is_body()));

        let mut newly_seen: Vec<u32> = Vec::new();
        for msg in &fetched {
            let mut line = Line::untagged()
                .number(msg.meta.seq as u64)
                .raw(" FETCH (");
            for (i, item) in ordered.iter().copied().enumerate() {
                if i > 0 {
                    line = line.sp();
                }
                line = render_fetch_item(line, item, msg);
                if marks_seen(item) {
                    newly_seen.push(msg.meta.uid);
                }
            }
            self.send(line.raw(")").finish()).await?;
        }

        // BODY[] without .PEEK implies \Seen on a writable mailbox.
        newly_seen.sort_unstable();
        newly_seen.dedup();
        if !self.read_only && !newly_seen.is_empty() {
            let set = SequenceSet::from_sorted(&newly_seen);
            let action = StoreAction {
                mode: StoreMode::Add,
                silent: true,
                flags: vec![crate::imap::types::Flag::Seen],
                unchanged_since: None,
            };
            if let Err(e) = mbx.store(true, &set, &action).await {
                tracing::debug!(session = %self.id(), error = %e, "fetch.seen");
            }
        }

        self.send_flush(response::ok(tag, "FETCH completed")).await
    }

    pub(crate) async fn cmd_store(
        &mut self,
        tag: &str,
        uid_mode: bool,
        seqs: &SequenceSet,
        action: &StoreAction,
    ) -> Result<()> {
        if self.read_only {
            return self
                .send_flush(response::no(tag, "mailbox is read-only"))
                .await;
        }
        if action.unchanged_since.is_some() {
            self.ensure_condstore().await?;
        }
        let (_, mbx) = self.selected();
        let outcome = match mbx.store(uid_mode, seqs, action).await {
            Ok(o) => o,
            Err(e) => return self.send_store_error(tag, e).await,
        };

        for meta in &outcome.stored {
            let mut parts: Vec<String> = Vec::new();
            if uid_mode {
                parts.push(format!("UID {}", meta.uid));
            }
            if self.condstore {
                parts.push(format!("MODSEQ ({})", meta.mod_seq));
            }
            if !action.silent {
                parts.push(format!("FLAGS ({})", flags_wire(&meta.flags)));
            }
            if parts.is_empty() {
                continue;
            }
            let line = Line::untagged()
                .number(meta.seq as u64)
                .raw(" FETCH (")
                .raw(&parts.join(" "))
                .raw(")")
                .finish();
            self.send(line).await?;
        }

        if outcome.failed.is_empty() {
            self.send_flush(response::ok(tag, "STORE completed")).await
        } else {
            let mut failed = outcome.failed.clone();
            failed.sort_unstable();
            let set = SequenceSet::from_sorted(&failed);
            self.send_flush(response::ok_code(
                tag,
                &format!("MODIFIED {}", set),
                "conditional STORE failed for some messages",
            ))
            .await
        }
    }

    pub(crate) async fn cmd_copy_move(
        &mut self,
        tag: &str,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
        is_move: bool,
    ) -> Result<()> {
        let verb = if is_move { "MOVE" } else { "COPY" };
        if is_move && self.read_only {
            return self
                .send_flush(response::no(tag, "mailbox is read-only"))
                .await;
        }
        if self.selected_name.as_deref() == Some(dst) {
            return self
                .send_flush(response::no(
                    tag,
                    "source and destination are the same mailbox",
                ))
                .await;
        }
        let dst_mbx = match self.store_session().mailbox(dst).await {
            Ok(m) => m,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let (mbx_id, mbx) = self.selected();
        let outcome = if is_move {
            mbx.move_messages(uid_mode, seqs, dst).await
        } else {
            mbx.copy_messages(uid_mode, seqs, dst).await
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => return self.send_store_error(tag, e).await,
        };

        let copyuid = format!(
            "COPYUID {} {} {}",
            outcome.uid_validity,
            SequenceSet::from_sorted(&outcome.src_uids),
            SequenceSet::from_sorted(&outcome.dst_uids),
        );

        if is_move {
            self.send(
                Line::untagged()
                    .raw("OK [")
                    .raw(&copyuid)
                    .raw("] moved")
                    .finish(),
            )
            .await?;
            for &n in &outcome.expunged_seqs {
                self.send(
                    Line::untagged()
                        .number(n as u64)
                        .raw(" EXPUNGE")
                        .finish(),
                )
                .await?;
            }
            for &n in &outcome.expunged_seqs {
                self.notify_mailbox(mbx_id, IdleUpdate::Expunge(n), true).await;
            }
        }

        // Destination listeners hear the new count; push devices wake.
        if let Ok(info) = dst_mbx.info().await {
            self.notify_mailbox(dst_mbx.id(), IdleUpdate::Exists(info.num_messages), false)
                .await;
        }
        self.push_wake(dst).await;

        if is_move {
            self.send_flush(response::ok(tag, "MOVE completed")).await
        } else {
            self.send_flush(response::ok_code(tag, &copyuid, "COPY completed"))
                .await
        }
    }
}

/// The MODSEQ reported on an ESEARCH line depends on which return options
/// were requested (RFC 7162 §3.1.5).
fn esearch_modseq(opts: &[SearchReturnOpt], hits: &[crate::storage::MessageMeta]) -> u64 {
    let has = |o: SearchReturnOpt| opts.contains(&o);
    let min_modseq = hits.first().map(|m| m.mod_seq).unwrap_or(0);
    let max_modseq = hits.last().map(|m| m.mod_seq).unwrap_or(0);
    if has(SearchReturnOpt::All) || has(SearchReturnOpt::Count) {
        hits.iter().map(|m| m.mod_seq).max().unwrap_or(0)
    } else if has(SearchReturnOpt::Min) && has(SearchReturnOpt::Max) {
        min_modseq.max(max_modseq)
    } else if has(SearchReturnOpt::Min) {
        min_modseq
    } else {
        max_modseq
    }
}

/// Non-peek body sections imply \Seen.
fn marks_seen(item: &FetchItem) -> bool {
    match item.item {
        FetchItemType::Body => item.section.is_some() && !item.peek,
        FetchItemType::Rfc822 | FetchItemType::Rfc822Text => true,
        _ => false,
    }
}

fn render_fetch_item(line: Line, item: &FetchItem, msg: &FetchedMessage) -> Line {
    let raw: &[u8] = msg.body.as_deref().map(|v| v.as_slice()).unwrap_or(&[]);
    match item.item {
        FetchItemType::Uid => line.raw("UID ").number(msg.meta.uid as u64),
        FetchItemType::Flags => line
            .raw("FLAGS (")
            .raw(&flags_wire(&msg.meta.flags))
            .raw(")"),
        FetchItemType::InternalDate => line
            .raw("INTERNALDATE \"")
            .raw(&mail_view::internal_date_string(&msg.meta.internal_date))
            .raw("\""),
        FetchItemType::Rfc822Size => line.raw("RFC822.SIZE ").number(msg.meta.size as u64),
        FetchItemType::ModSeq => line.raw("MODSEQ (").number(msg.meta.mod_seq).raw(")"),
        FetchItemType::Envelope => line.raw("ENVELOPE ").bytes(&mail_view::envelope(raw)),
        FetchItemType::BodyStructure => line
            .raw("BODYSTRUCTURE ")
            .bytes(&mail_view::body_structure(raw, true)),
        FetchItemType::Rfc822 => line.raw("RFC822 ").literal(raw),
        FetchItemType::Rfc822Header => {
            let (header, _) = mail_view::split_message(raw);
            line.raw("RFC822.HEADER ").literal(header)
        }
        FetchItemType::Rfc822Text => {
            let (_, body) = mail_view::split_message(raw);
            line.raw("RFC822.TEXT ").literal(body)
        }
        FetchItemType::Body => match &item.section {
            None => line.raw("BODY ").bytes(&mail_view::body_structure(raw, false)),
            Some(section) => {
                let data = mail_view::section_bytes(raw, section);
                let (slice, origin) = mail_view::apply_partial(&data, item.partial);
                let mut line = line
                    .raw("BODY[")
                    .bytes(&render_section(section))
                    .raw("]");
                if let Some(origin) = origin {
                    line = line.raw("<").number(origin as u64).raw(">");
                }
                line.sp().literal(&slice)
            }
        },
    }
}

/// The section spec as echoed in the response item (PEEK never appears).
fn render_section(section: &Section) -> Vec<u8> {
    let mut line = Line::fragment();
    let mut first = true;
    for part in &section.parts {
        if !first {
            line = line.raw(".");
        }
        line = line.number(*part as u64);
        first = false;
    }
    let name = match section.name {
        SectionName::Full => "",
        SectionName::Header => "HEADER",
        SectionName::HeaderFields => "HEADER.FIELDS",
        SectionName::HeaderFieldsNot => "HEADER.FIELDS.NOT",
        SectionName::Text => "TEXT",
        SectionName::Mime => "MIME",
    };
    if !name.is_empty() {
        if !first {
            line = line.raw(".");
        }
        line = line.raw(name);
    }
    if matches!(
        section.name,
        SectionName::HeaderFields | SectionName::HeaderFieldsNot
    ) {
        line = line.raw(" (");
        for (i, field) in section.fields.iter().enumerate() {
            if i > 0 {
                line = line.sp();
            }
            line = line.string(field.as_bytes());
        }
        line = line.raw(")");
    }
    line.into_bytes()
}
