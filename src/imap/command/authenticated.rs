//! Commands legal once authenticated: mailbox management, LIST/LSUB, STATUS,
//! APPEND, ENABLE, IDLE and the push-device registration.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};

use super::matches_wildcard;
use crate::imap::flow::Mode;
use crate::imap::notify::IdleUpdate;
use crate::imap::response::{self, Line};
use crate::imap::session::Session;
use crate::imap::types::{
    Flag, ListReturnOpt, ListSelectOpt, QresyncParams, StatusItem,
};
use crate::storage::{MailboxAttr, PushDevice, StoreError};

const DEFAULT_FLAGS: &str = "\\Answered \\Flagged \\Deleted \\Seen \\Draft";

impl Session {
    pub(crate) async fn cmd_select(
        &mut self,
        tag: &str,
        mailbox: &str,
        condstore: bool,
        _qresync: Option<&QresyncParams>,
        examine: bool,
    ) -> Result<()> {
        // Any previously selected mailbox is closed first; a failed SELECT
        // leaves the session in Auth mode.
        self.deselect().await;
        self.mode = Mode::Auth;

        let mbx = match self.store_session().mailbox(mailbox).await {
            Ok(m) => m,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let info = match mbx.info().await {
            Ok(i) => i,
            Err(e) => return self.send_store_error(tag, e).await,
        };

        self.send(
            Line::untagged()
                .number(info.num_messages as u64)
                .raw(" EXISTS")
                .finish(),
        )
        .await?;
        self.send(
            Line::untagged()
                .number(info.num_recent as u64)
                .raw(" RECENT")
                .finish(),
        )
        .await?;
        self.send(
            Line::untagged()
                .raw("FLAGS (")
                .raw(DEFAULT_FLAGS)
                .raw(")")
                .finish(),
        )
        .await?;
        self.send(
            Line::untagged()
                .raw("OK [PERMANENTFLAGS (")
                .raw(DEFAULT_FLAGS)
                .raw(" \\*)] flags permitted")
                .finish(),
        )
        .await?;
        self.send(
            Line::untagged()
                .raw("OK [HIGHESTMODSEQ ")
                .number(info.highest_mod_seq)
                .raw("] modseq")
                .finish(),
        )
        .await?;
        if info.first_unseen_seq != 0 {
            self.send(
                Line::untagged()
                    .raw("OK [UNSEEN ")
                    .number(info.first_unseen_seq as u64)
                    .raw("] first unseen")
                    .finish(),
            )
            .await?;
        }
        self.send(
            Line::untagged()
                .raw("OK [UIDVALIDITY ")
                .number(info.uid_validity as u64)
                .raw("] UIDs valid")
                .finish(),
        )
        .await?;
        self.send(
            Line::untagged()
                .raw("OK [UIDNEXT ")
                .number(info.uid_next as u64)
                .raw("] predicted next UID")
                .finish(),
        )
        .await?;

        self.read_only = examine;
        self.condstore = self.condstore || condstore;
        self.selected_name = Some(mailbox.to_string());
        self.shared.set_selected(Some((mbx.id(), mbx)));
        self.mode = Mode::Selected;

        let name = if examine { "EXAMINE" } else { "SELECT" };
        let access = if examine { "READ-ONLY" } else { "READ-WRITE" };
        let mut text = format!("{} completed", name);
        if condstore {
            text.push_str(", CONDSTORE enabled");
        }
        tracing::debug!(session = %self.id(), mailbox = %mailbox, readonly = examine, "mailbox.selected");
        self.send_flush(response::ok_code(tag, access, &text)).await
    }

    pub(crate) async fn cmd_create(&mut self, tag: &str, mailbox: &str) -> Result<()> {
        if mailbox == "INBOX" {
            return self.send_flush(response::no(tag, "INBOX always exists")).await;
        }
        match self.store_session().create_mailbox(mailbox, &[]).await {
            Ok(()) => self.send_flush(response::ok(tag, "CREATE completed")).await,
            Err(e) => self.send_store_error(tag, e).await,
        }
    }

    pub(crate) async fn cmd_delete(&mut self, tag: &str, mailbox: &str) -> Result<()> {
        match self.store_session().delete_mailbox(mailbox).await {
            Ok(()) => self.send_flush(response::ok(tag, "DELETE completed")).await,
            Err(e) => self.send_store_error(tag, e).await,
        }
    }

    pub(crate) async fn cmd_rename(&mut self, tag: &str, from: &str, to: &str) -> Result<()> {
        match self.store_session().rename_mailbox(from, to).await {
            Ok(()) => self.send_flush(response::ok(tag, "RENAME completed")).await,
            Err(e) => self.send_store_error(tag, e).await,
        }
    }

    /// All mailboxes are implicitly subscribed; both commands succeed without
    /// store effect.
    pub(crate) async fn cmd_subscribe(
        &mut self,
        tag: &str,
        mailbox: &str,
        subscribe: bool,
    ) -> Result<()> {
        if let Err(e) = self.store_session().mailbox(mailbox).await {
            return self.send_store_error(tag, e).await;
        }
        let text = if subscribe {
            "SUBSCRIBE completed"
        } else {
            "UNSUBSCRIBE completed"
        };
        self.send_flush(response::ok(tag, text)).await
    }

    pub(crate) async fn cmd_list(
        &mut self,
        tag: &str,
        select_opts: &[ListSelectOpt],
        reference: &str,
        pattern: &str,
        return_opts: &[ListReturnOpt],
        lsub: bool,
    ) -> Result<()> {
        let verb = if lsub { "LSUB" } else { "LIST" };
        if pattern.is_empty() {
            // Hierarchy delimiter probe.
            let line = Line::untagged()
                .raw(verb)
                .raw(" (\\Noselect) \"/\" \"\"")
                .finish();
            self.send(line).await?;
            return self
                .send_flush(response::ok(tag, &format!("{} completed", verb)))
                .await;
        }

        let summaries = match self.store_session().mailboxes().await {
            Ok(s) => s,
            Err(e) => return self.send_store_error(tag, e).await,
        };

        // Intermediate hierarchy levels show up as \Noselect entries.
        let mut tree: BTreeMap<String, Option<Vec<MailboxAttr>>> = BTreeMap::new();
        for s in &summaries {
            for (i, _) in s.name.match_indices('/') {
                if i > 0 {
                    tree.entry(s.name[..i].to_string()).or_insert(None);
                }
            }
            tree.insert(s.name.clone(), Some(s.attrs.clone()));
        }

        let glob = format!("{}{}", reference, pattern);
        let special_only = select_opts.contains(&ListSelectOpt::SpecialUse);
        let want_children = return_opts.contains(&ListReturnOpt::Children);
        let want_subscribed = return_opts.contains(&ListReturnOpt::Subscribed)
            || select_opts.contains(&ListSelectOpt::Subscribed);

        for (name, attrs) in &tree {
            if !matches_wildcard(&glob, name) {
                continue;
            }
            let mut shown: Vec<String> = Vec::new();
            match attrs {
                None => shown.push("\\Noselect".to_string()),
                Some(attrs) => {
                    for a in attrs {
                        shown.push(a.as_str().to_string());
                    }
                }
            }
            if special_only && !shown.iter().any(|a| is_special_use(a)) {
                continue;
            }
            if want_children && !lsub {
                let prefix = format!("{}/", name);
                if tree.keys().any(|k| k.starts_with(&prefix)) {
                    shown.push("\\HasChildren".to_string());
                } else {
                    shown.push("\\HasNoChildren".to_string());
                }
            }
            if want_subscribed && attrs.is_some() {
                shown.push("\\Subscribed".to_string());
            }
            let line = Line::untagged()
                .raw(verb)
                .raw(" (")
                .raw(&shown.join(" "))
                .raw(") \"/\" ")
                .mailbox(name)
                .finish();
            self.send(line).await?;
        }
        self.send_flush(response::ok(tag, &format!("{} completed", verb)))
            .await
    }

    pub(crate) async fn cmd_status(
        &mut self,
        tag: &str,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<()> {
        let mbx = match self.store_session().mailbox(mailbox).await {
            Ok(m) => m,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let info = match mbx.info().await {
            Ok(i) => i,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let mut line = Line::untagged().raw("STATUS ").mailbox(mailbox).raw(" (");
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                line = line.sp();
            }
            line = match item {
                StatusItem::Messages => line.raw("MESSAGES ").number(info.num_messages as u64),
                StatusItem::Recent => line.raw("RECENT ").number(info.num_recent as u64),
                StatusItem::UidNext => line.raw("UIDNEXT ").number(info.uid_next as u64),
                StatusItem::UidValidity => {
                    line.raw("UIDVALIDITY ").number(info.uid_validity as u64)
                }
                StatusItem::Unseen => line.raw("UNSEEN ").number(info.num_unseen as u64),
                StatusItem::HighestModSeq => {
                    line.raw("HIGHESTMODSEQ ").number(info.highest_mod_seq)
                }
            };
        }
        self.send(line.raw(")").finish()).await?;
        self.send_flush(response::ok(tag, "STATUS completed")).await
    }

    pub(crate) async fn cmd_append(
        &mut self,
        tag: &str,
        mailbox: &str,
        flags: &[Flag],
        date: Option<DateTime<FixedOffset>>,
        message: &[u8],
    ) -> Result<()> {
        let mbx = match self.store_session().mailbox(mailbox).await {
            Ok(m) => m,
            Err(StoreError::NoSuchMailbox(name)) => {
                return self
                    .send_flush(response::no(
                        tag,
                        &format!("[TRYCREATE] no such mailbox {}", name),
                    ))
                    .await;
            }
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let uid = match mbx.append(flags, date, message).await {
            Ok(uid) => uid,
            Err(e) => return self.send_store_error(tag, e).await,
        };
        let info = mbx.info().await.context("mailbox info after append")?;
        tracing::debug!(session = %self.id(), mailbox = %mailbox, uid, "imap.append");

        self.notify_mailbox(mbx.id(), IdleUpdate::Exists(info.num_messages), false)
            .await;
        self.push_wake(mailbox).await;

        self.send_flush(response::ok_code(
            tag,
            &format!("APPENDUID {} {}", info.uid_validity, uid),
            "APPEND completed",
        ))
        .await
    }

    pub(crate) async fn cmd_enable(&mut self, tag: &str, capabilities: &[String]) -> Result<()> {
        let mut enabled: Vec<&str> = Vec::new();
        for cap in capabilities {
            if cap == "CONDSTORE" && !self.condstore {
                self.condstore = true;
                enabled.push("CONDSTORE");
            }
        }
        let mut line = Line::untagged().raw("ENABLED");
        for cap in &enabled {
            line = line.sp().raw(cap);
        }
        self.send(line.finish()).await?;
        self.send_flush(response::ok(tag, "ENABLE completed")).await
    }

    /// IDLE: flush queued updates, hand out the continuation, then block on a
    /// single line which must be DONE. `idle_started` persists afterwards so
    /// later changes stay eligible for delivery.
    pub(crate) async fn cmd_idle(&mut self, tag: &str) -> Result<()> {
        {
            let mut out = self.shared.out.lock().await;
            out.idle_started = true;
            out.idling = true;
            out.flush_updates().await.context("idle flush")?;
            out.write_line(b"+ idling\r\n").await.context("idle continuation")?;
            out.flush().await.context("idle continuation flush")?;
        }
        let done = self.idle_wait().await;
        {
            let mut out = self.shared.out.lock().await;
            out.idling = false;
        }
        match done {
            Ok(true) => self.send_flush(response::ok(tag, "IDLE completed")).await,
            Ok(false) => {
                self.send_flush(response::bad(tag, "expected DONE to end IDLE"))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn cmd_apple_push(
        &mut self,
        tag: &str,
        params: &crate::imap::types::ApplePushParams,
    ) -> Result<()> {
        let topic = match self.notifier.apns.as_ref() {
            Some(apns) => apns.topic.clone(),
            None => {
                return self
                    .send_flush(response::no(tag, "push service not configured"))
                    .await;
            }
        };
        if params.device_token.is_empty() || params.account_id.is_empty() {
            return self
                .send_flush(response::bad(tag, "aps-device-token and aps-account-id required"))
                .await;
        }
        let device = PushDevice {
            token: params.device_token.clone(),
            account_id: params.account_id.clone(),
        };
        let mailboxes: Vec<String> = if params.mailboxes.is_empty() {
            vec!["INBOX".to_string()]
        } else {
            params.mailboxes.clone()
        };
        for mailbox in &mailboxes {
            if let Err(e) = self
                .store_session()
                .register_push_device(mailbox, device.clone())
                .await
            {
                return self.send_store_error(tag, e).await;
            }
        }
        tracing::info!(session = %self.id(), mailboxes = mailboxes.len(), "apns.register");
        let line = Line::untagged()
            .raw("XAPPLEPUSHSERVICE aps-version 2 aps-topic ")
            .string(topic.as_bytes())
            .finish();
        self.send(line).await?;
        self.send_flush(response::ok(tag, "XAPPLEPUSHSERVICE completed"))
            .await
    }
}

fn is_special_use(attr: &str) -> bool {
    matches!(
        attr,
        "\\Drafts" | "\\Sent" | "\\Junk" | "\\Archive" | "\\Trash" | "\\Flagged" | "\\All"
    )
}
