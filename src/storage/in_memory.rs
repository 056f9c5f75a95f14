//! In-memory store backend.
//!
//! Holds every user's mail in process memory: enough to run the server end to
//! end and to back the integration tests. UID, UIDVALIDITY and MODSEQ
//! bookkeeping follows the same rules a persistent backend must obey.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::RwLock;

use super::*;
use crate::imap::types::{Flag, SearchOp, SequenceSet, StoreAction, StoreMode};

pub struct MemStore {
    users: StdMutex<BTreeMap<String, Arc<MemUser>>>,
    notifier: StdMutex<Option<Arc<dyn MailboxNotifier>>>,
    next_id: AtomicU64,
}

struct MemUser {
    id: UserId,
    password: String,
    mailboxes: RwLock<BTreeMap<String, Arc<MemMailbox>>>,
    devices: RwLock<BTreeMap<String, Vec<PushDevice>>>,
}

pub struct MemMailbox {
    id: MailboxId,
    user: Weak<MemUser>,
    name: StdMutex<String>,
    state: RwLock<MboxState>,
}

struct MboxState {
    uid_validity: u32,
    uid_next: u32,
    highest_mod_seq: u64,
    messages: Vec<MemMessage>,
}

#[derive(Clone)]
struct MemMessage {
    uid: u32,
    flags: Vec<Flag>,
    recent: bool,
    mod_seq: u64,
    internal_date: DateTime<Utc>,
    raw: Arc<Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            users: StdMutex::new(BTreeMap::new()),
            notifier: StdMutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_user(self: &Arc<Self>, name: &str, password: &str) {
        let user_id = self.next_id();
        let inbox_id = self.next_id();
        let user = Arc::new_cyclic(|weak: &Weak<MemUser>| {
            let inbox = MemMailbox::new(inbox_id, weak.clone());
            *inbox.name.lock().expect("name lock") = "INBOX".to_string();
            let mut map = BTreeMap::new();
            map.insert("INBOX".to_string(), Arc::new(inbox));
            MemUser {
                id: user_id,
                password: password.to_string(),
                mailboxes: RwLock::new(map),
                devices: RwLock::new(BTreeMap::new()),
            }
        });
        self.users
            .lock()
            .expect("user table lock")
            .insert(name.to_string(), user);
    }

    /// Out-of-band delivery (the SMTP path in a full deployment). Appends and
    /// fires the registered notifier with the mailbox's push devices.
    pub async fn deliver(&self, username: &str, mailbox: &str, raw: &[u8]) -> Result<u32, StoreError> {
        let user = self
            .users
            .lock()
            .expect("user table lock")
            .get(username)
            .cloned()
            .ok_or(StoreError::BadCredentials)?;
        let mbx = user
            .mailboxes
            .read()
            .await
            .get(mailbox)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchMailbox(mailbox.to_string()))?;
        let uid = mbx.append(&[], None, raw).await?;
        let notifier = self.notifier.lock().expect("notifier lock").clone();
        if let Some(n) = notifier {
            let devices = user
                .devices
                .read()
                .await
                .get(mailbox)
                .cloned()
                .unwrap_or_default();
            n.notify(user.id, mbx.id, mailbox, devices).await;
        }
        Ok(uid)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserId, Box<dyn StoreSession>), StoreError> {
        let user = self
            .users
            .lock()
            .expect("user table lock")
            .get(username)
            .cloned()
            .ok_or(StoreError::BadCredentials)?;
        if user.password != password {
            return Err(StoreError::BadCredentials);
        }
        Ok((user.id, Box::new(MemSession { user })))
    }

    fn register_notifier(&self, notifier: Arc<dyn MailboxNotifier>) {
        *self.notifier.lock().expect("notifier lock") = Some(notifier);
    }
}

struct MemSession {
    user: Arc<MemUser>,
}

#[async_trait]
impl StoreSession for MemSession {
    async fn mailboxes(&self) -> Result<Vec<MailboxSummary>, StoreError> {
        let map = self.user.mailboxes.read().await;
        let mut out = Vec::with_capacity(map.len());
        for name in map.keys() {
            out.push(MailboxSummary {
                name: name.clone(),
                attrs: special_use_for(name),
            });
        }
        Ok(out)
    }

    async fn mailbox(&self, name: &str) -> Result<Arc<dyn Mailbox>, StoreError> {
        let map = self.user.mailboxes.read().await;
        map.get(name)
            .cloned()
            .map(|m| m as Arc<dyn Mailbox>)
            .ok_or_else(|| StoreError::NoSuchMailbox(name.to_string()))
    }

    async fn create_mailbox(&self, name: &str, _attrs: &[MailboxAttr]) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::Rejected("empty mailbox name".into()));
        }
        let owner = Arc::downgrade(&self.user);
        let mut map = self.user.mailboxes.write().await;
        if map.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let id = NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed);
        let mbx = MemMailbox::new(id, owner);
        *mbx.name.lock().expect("name lock") = name.to_string();
        map.insert(name.to_string(), Arc::new(mbx));
        Ok(())
    }

    async fn delete_mailbox(&self, name: &str) -> Result<(), StoreError> {
        if name == "INBOX" {
            return Err(StoreError::Rejected("cannot delete INBOX".into()));
        }
        let mut map = self.user.mailboxes.write().await;
        map.remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchMailbox(name.to_string()))
    }

    async fn rename_mailbox(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut map = self.user.mailboxes.write().await;
        if map.contains_key(to) {
            return Err(StoreError::AlreadyExists(to.to_string()));
        }
        if from == "INBOX" {
            // RFC 3501: renaming INBOX moves its messages and leaves INBOX
            // empty.
            let inbox = map
                .get("INBOX")
                .cloned()
                .ok_or_else(|| StoreError::NoSuchMailbox(from.to_string()))?;
            let id = NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed);
            let fresh = MemMailbox::new(id, inbox.user.clone());
            *fresh.name.lock().expect("name lock") = to.to_string();
            {
                let mut src = inbox.state.write().await;
                let mut dst = fresh.state.write().await;
                // Messages keep their (UID, UIDVALIDITY) identity at the new
                // name; the emptied INBOX is the one that changes validity.
                dst.messages = std::mem::take(&mut src.messages);
                dst.uid_next = src.uid_next;
                dst.highest_mod_seq = src.highest_mod_seq;
                dst.uid_validity = src.uid_validity;
                src.uid_validity += 1;
            }
            map.insert(to.to_string(), Arc::new(fresh));
            return Ok(());
        }
        let mbx = map
            .remove(from)
            .ok_or_else(|| StoreError::NoSuchMailbox(from.to_string()))?;
        *mbx.name.lock().expect("name lock") = to.to_string();
        map.insert(to.to_string(), mbx);
        Ok(())
    }

    async fn register_push_device(
        &self,
        mailbox: &str,
        device: PushDevice,
    ) -> Result<(), StoreError> {
        if !self.user.mailboxes.read().await.contains_key(mailbox) {
            return Err(StoreError::NoSuchMailbox(mailbox.to_string()));
        }
        let mut devices = self.user.devices.write().await;
        let list = devices.entry(mailbox.to_string()).or_default();
        if !list.contains(&device) {
            list.push(device);
        }
        Ok(())
    }

    async fn push_devices(&self, mailbox: &str) -> Vec<PushDevice> {
        self.user
            .devices
            .read()
            .await
            .get(mailbox)
            .cloned()
            .unwrap_or_default()
    }

    async fn close(&self) {}
}

static NEXT_MAILBOX_ID: AtomicU64 = AtomicU64::new(1 << 32);

impl MemMailbox {
    fn new(id: MailboxId, user: Weak<MemUser>) -> Self {
        Self {
            id,
            user,
            name: StdMutex::new(String::new()),
            state: RwLock::new(MboxState {
                uid_validity: 1,
                uid_next: 1,
                highest_mod_seq: 1,
                messages: Vec::new(),
            }),
        }
    }

    fn name(&self) -> String {
        self.name.lock().expect("name lock").clone()
    }
}

fn special_use_for(name: &str) -> Vec<MailboxAttr> {
    match name {
        "Drafts" => vec![MailboxAttr::Drafts],
        "Sent" => vec![MailboxAttr::Sent],
        "Junk" | "Spam" => vec![MailboxAttr::Junk],
        "Archive" => vec![MailboxAttr::Archive],
        "Trash" => vec![MailboxAttr::Trash],
        _ => vec![],
    }
}

fn meta_of(seq: u32, m: &MemMessage) -> MessageMeta {
    MessageMeta {
        seq,
        uid: m.uid,
        mod_seq: m.mod_seq,
        flags: m.flags.clone(),
        internal_date: m.internal_date,
        size: m.raw.len() as u32,
    }
}

fn has_flag(flags: &[Flag], want: &Flag) -> bool {
    flags.iter().any(|f| match (f, want) {
        (Flag::Keyword(a), Flag::Keyword(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => a == b,
    })
}

/// Indices of the messages selected by `seqs` under seq or uid addressing.
fn select_indices(state: &MboxState, uid_mode: bool, seqs: &SequenceSet) -> Vec<usize> {
    let highest = if uid_mode {
        state.messages.last().map(|m| m.uid).unwrap_or(0)
    } else {
        state.messages.len() as u32
    };
    let mut out = Vec::new();
    for (i, m) in state.messages.iter().enumerate() {
        let n = if uid_mode { m.uid } else { i as u32 + 1 };
        if seqs.contains(n, highest) {
            out.push(i);
        }
    }
    out
}

fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        (&raw[..pos + 4], &raw[pos + 4..])
    } else if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        (&raw[..pos + 2], &raw[pos + 2..])
    } else {
        (raw, &[])
    }
}

fn trim_start(b: &[u8]) -> &[u8] {
    let skip = b.iter().take_while(|&&c| c == b' ' || c == b'\t').count();
    &b[skip..]
}

fn ascii_contains_ci(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Value of a header field with unfolding, or None when absent.
fn header_value(raw: &[u8], name: &str) -> Option<String> {
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

fn sent_date(raw: &[u8]) -> Option<DateTime<FixedOffset>> {
    let v = header_value(raw, "Date")?;
    DateTime::parse_from_rfc2822(&v).ok()
}

fn eval_search(op: &SearchOp, state: &MboxState, idx: usize) -> bool {
    let m = &state.messages[idx];
    let seq = idx as u32 + 1;
    match op {
        SearchOp::All => true,
        SearchOp::Answered => has_flag(&m.flags, &Flag::Answered),
        SearchOp::Deleted => has_flag(&m.flags, &Flag::Deleted),
        SearchOp::Draft => has_flag(&m.flags, &Flag::Draft),
        SearchOp::Flagged => has_flag(&m.flags, &Flag::Flagged),
        SearchOp::Seen => has_flag(&m.flags, &Flag::Seen),
        SearchOp::Unanswered => !has_flag(&m.flags, &Flag::Answered),
        SearchOp::Undeleted => !has_flag(&m.flags, &Flag::Deleted),
        SearchOp::Undraft => !has_flag(&m.flags, &Flag::Draft),
        SearchOp::Unflagged => !has_flag(&m.flags, &Flag::Flagged),
        SearchOp::Unseen => !has_flag(&m.flags, &Flag::Seen),
        SearchOp::New => m.recent && !has_flag(&m.flags, &Flag::Seen),
        SearchOp::Old => !m.recent,
        SearchOp::Recent => m.recent,
        SearchOp::Keyword(kw) => has_flag(&m.flags, &Flag::Keyword(kw.clone())),
        SearchOp::Unkeyword(kw) => !has_flag(&m.flags, &Flag::Keyword(kw.clone())),
        SearchOp::SeqSet(set) => set.contains(seq, state.messages.len() as u32),
        SearchOp::Uid(set) => {
            let highest = state.messages.last().map(|m| m.uid).unwrap_or(0);
            set.contains(m.uid, highest)
        }
        SearchOp::Bcc(s) => header_contains(&m.raw, "Bcc", s),
        SearchOp::Cc(s) => header_contains(&m.raw, "Cc", s),
        SearchOp::From(s) => header_contains(&m.raw, "From", s),
        SearchOp::To(s) => header_contains(&m.raw, "To", s),
        SearchOp::Subject(s) => header_contains(&m.raw, "Subject", s),
        SearchOp::Header(name, s) => match header_value(&m.raw, name) {
            Some(v) => ascii_contains_ci(v.as_bytes(), s.as_bytes()),
            None => false,
        },
        SearchOp::Body(s) => {
            let (_, body) = split_message(&m.raw);
            ascii_contains_ci(body, s.as_bytes())
        }
        SearchOp::Text(s) => ascii_contains_ci(&m.raw, s.as_bytes()),
        SearchOp::Before(d) => m.internal_date.date_naive() < d.date_naive(),
        SearchOp::On(d) => m.internal_date.date_naive() == d.date_naive(),
        SearchOp::Since(d) => m.internal_date.date_naive() >= d.date_naive(),
        SearchOp::SentBefore(d) => {
            sent_date(&m.raw).map_or(false, |s| s.date_naive() < d.date_naive())
        }
        SearchOp::SentOn(d) => {
            sent_date(&m.raw).map_or(false, |s| s.date_naive() == d.date_naive())
        }
        SearchOp::SentSince(d) => {
            sent_date(&m.raw).map_or(false, |s| s.date_naive() >= d.date_naive())
        }
        SearchOp::Larger(n) => m.raw.len() as u32 > *n,
        SearchOp::Smaller(n) => (m.raw.len() as u32) < *n,
        SearchOp::ModSeq(n) => m.mod_seq >= *n,
        SearchOp::And(kids) => kids.iter().all(|k| eval_search(k, state, idx)),
        SearchOp::Or(a, b) => eval_search(a, state, idx) || eval_search(b, state, idx),
        SearchOp::Not(k) => !eval_search(k, state, idx),
    }
}

fn header_contains(raw: &[u8], name: &str, needle: &str) -> bool {
    match header_value(raw, name) {
        Some(v) => ascii_contains_ci(v.as_bytes(), needle.as_bytes()),
        None => false,
    }
}

fn apply_flags(current: &mut Vec<Flag>, action: &StoreAction) -> bool {
    let before = current.clone();
    match action.mode {
        StoreMode::Replace => {
            *current = action.flags.clone();
        }
        StoreMode::Add => {
            for f in &action.flags {
                if !has_flag(current, f) {
                    current.push(f.clone());
                }
            }
        }
        StoreMode::Remove => {
            current.retain(|f| !has_flag(&action.flags, f));
        }
    }
    *current != before
}

#[async_trait]
impl Mailbox for MemMailbox {
    fn id(&self) -> MailboxId {
        self.id
    }

    async fn info(&self) -> Result<MailboxInfo, StoreError> {
        let state = self.state.read().await;
        let num_unseen = state
            .messages
            .iter()
            .filter(|m| !has_flag(&m.flags, &Flag::Seen))
            .count() as u32;
        let first_unseen_seq = state
            .messages
            .iter()
            .position(|m| !has_flag(&m.flags, &Flag::Seen))
            .map(|i| i as u32 + 1)
            .unwrap_or(0);
        let name = self.name();
        Ok(MailboxInfo {
            attrs: special_use_for(&name),
            name,
            num_messages: state.messages.len() as u32,
            num_recent: state.messages.iter().filter(|m| m.recent).count() as u32,
            num_unseen,
            first_unseen_seq,
            uid_next: state.uid_next,
            uid_validity: state.uid_validity,
            highest_mod_seq: state.highest_mod_seq,
        })
    }

    async fn append(
        &self,
        flags: &[Flag],
        date: Option<DateTime<FixedOffset>>,
        content: &[u8],
    ) -> Result<u32, StoreError> {
        let mut state = self.state.write().await;
        let uid = state.uid_next;
        state.uid_next += 1;
        state.highest_mod_seq += 1;
        let mod_seq = state.highest_mod_seq;
        state.messages.push(MemMessage {
            uid,
            flags: flags.to_vec(),
            recent: true,
            mod_seq,
            internal_date: date.map(|d| d.with_timezone(&Utc)).unwrap_or_else(Utc::now),
            raw: Arc::new(content.to_vec()),
        });
        Ok(uid)
    }

    async fn search(&self, op: &SearchOp, _uid_mode: bool) -> Result<Vec<MessageMeta>, StoreError> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for i in 0..state.messages.len() {
            if eval_search(op, &state, i) {
                out.push(meta_of(i as u32 + 1, &state.messages[i]));
            }
        }
        Ok(out)
    }

    async fn fetch(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        changed_since: Option<u64>,
        need_body: bool,
    ) -> Result<Vec<FetchedMessage>, StoreError> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for i in select_indices(&state, uid_mode, seqs) {
            let m = &state.messages[i];
            if let Some(cs) = changed_since {
                if m.mod_seq <= cs {
                    continue;
                }
            }
            out.push(FetchedMessage {
                meta: meta_of(i as u32 + 1, m),
                body: need_body.then(|| m.raw.clone()),
            });
        }
        Ok(out)
    }

    async fn expunge(&self, uid_seqs: Option<&SequenceSet>) -> Result<Vec<u32>, StoreError> {
        let mut state = self.state.write().await;
        let highest_uid = state.messages.last().map(|m| m.uid).unwrap_or(0);
        let mut expunged = Vec::new();
        let mut i = 0;
        while i < state.messages.len() {
            let m = &state.messages[i];
            let selected = uid_seqs.map_or(true, |set| set.contains(m.uid, highest_uid));
            if selected && has_flag(&m.flags, &Flag::Deleted) {
                state.messages.remove(i);
                // Sequence numbers renumber after each removal, so the
                // current index is the reported number.
                expunged.push(i as u32 + 1);
            } else {
                i += 1;
            }
        }
        if !expunged.is_empty() {
            state.highest_mod_seq += 1;
        }
        Ok(expunged)
    }

    async fn store(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        action: &StoreAction,
    ) -> Result<StoreOutcome, StoreError> {
        let mut state = self.state.write().await;
        let mut outcome = StoreOutcome::default();
        for i in select_indices(&state, uid_mode, seqs) {
            let mod_seq = state.messages[i].mod_seq;
            if let Some(limit) = action.unchanged_since {
                if mod_seq > limit {
                    let m = &state.messages[i];
                    outcome
                        .failed
                        .push(if uid_mode { m.uid } else { i as u32 + 1 });
                    continue;
                }
            }
            let changed = apply_flags(&mut state.messages[i].flags, action);
            if changed {
                state.highest_mod_seq += 1;
                state.messages[i].mod_seq = state.highest_mod_seq;
            }
            outcome.stored.push(meta_of(i as u32 + 1, &state.messages[i]));
        }
        Ok(outcome)
    }

    async fn move_messages(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
    ) -> Result<CopyOutcome, StoreError> {
        let mut outcome = self.copy_into(uid_mode, seqs, dst).await?;
        let mut state = self.state.write().await;
        let moved: Vec<u32> = outcome.src_uids.clone();
        let mut i = 0;
        while i < state.messages.len() {
            if moved.contains(&state.messages[i].uid) {
                state.messages.remove(i);
                outcome.expunged_seqs.push(i as u32 + 1);
            } else {
                i += 1;
            }
        }
        if !outcome.expunged_seqs.is_empty() {
            state.highest_mod_seq += 1;
        }
        Ok(outcome)
    }

    async fn copy_messages(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
    ) -> Result<CopyOutcome, StoreError> {
        self.copy_into(uid_mode, seqs, dst).await
    }

    async fn highest_mod_seq(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.highest_mod_seq)
    }

    /// Clears the \Recent status: this session has had its chance to see it.
    async fn close(&self) {
        let mut state = self.state.write().await;
        for m in state.messages.iter_mut() {
            m.recent = false;
        }
    }
}

impl MemMailbox {
    async fn copy_into(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
    ) -> Result<CopyOutcome, StoreError> {
        let user = self
            .user
            .upgrade()
            .ok_or_else(|| StoreError::Internal("user is gone".into()))?;
        let dst_mbx = user
            .mailboxes
            .read()
            .await
            .get(dst)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchMailbox(dst.to_string()))?;
        let picked: Vec<MemMessage> = {
            let state = self.state.read().await;
            select_indices(&state, uid_mode, seqs)
                .into_iter()
                .map(|i| state.messages[i].clone())
                .collect()
        };
        if picked.is_empty() {
            return Err(StoreError::Rejected("no messages in set".into()));
        }
        let mut outcome = CopyOutcome::default();
        let mut dst_state = dst_mbx.state.write().await;
        outcome.uid_validity = dst_state.uid_validity;
        for m in picked {
            let uid = dst_state.uid_next;
            dst_state.uid_next += 1;
            dst_state.highest_mod_seq += 1;
            let mod_seq = dst_state.highest_mod_seq;
            outcome.src_uids.push(m.uid);
            outcome.dst_uids.push(uid);
            dst_state.messages.push(MemMessage {
                uid,
                recent: true,
                mod_seq,
                ..m
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::types::SeqRange;

    async fn fixture() -> (Arc<MemStore>, Box<dyn StoreSession>, Arc<dyn Mailbox>) {
        let store = MemStore::new();
        store.add_user("alice", "hunter2");
        let (_uid, session) = store.login("alice", "hunter2").await.expect("login");
        let mbx = session.mailbox("INBOX").await.expect("INBOX exists");
        (store, session, mbx)
    }

    fn msg(subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: bob@example.tld\r\nTo: alice@example.tld\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\nSubject: {}\r\n\r\n{}",
            subject, body
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let store = MemStore::new();
        store.add_user("alice", "hunter2");
        assert!(matches!(
            store.login("alice", "wrong").await,
            Err(StoreError::BadCredentials)
        ));
        assert!(matches!(
            store.login("nobody", "x").await,
            Err(StoreError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn append_advances_uid_and_modseq() {
        let (_store, _session, mbx) = fixture().await;
        let base = mbx.highest_mod_seq().await.unwrap();
        let u1 = mbx.append(&[], None, &msg("a", "1")).await.unwrap();
        let u2 = mbx.append(&[], None, &msg("b", "2")).await.unwrap();
        assert_eq!((u1, u2), (1, 2));
        let info = mbx.info().await.unwrap();
        assert_eq!(info.num_messages, 2);
        assert_eq!(info.uid_next, 3);
        assert!(info.highest_mod_seq > base);
        assert_eq!(info.first_unseen_seq, 1);
    }

    #[tokio::test]
    async fn store_respects_unchangedsince() {
        let (_store, _session, mbx) = fixture().await;
        for i in 0..3 {
            mbx.append(&[], None, &msg(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }
        // bump message 3's modseq
        let all = SequenceSet(vec![SeqRange::single(3)]);
        let action = StoreAction {
            mode: StoreMode::Add,
            silent: false,
            flags: vec![Flag::Flagged],
            unchanged_since: None,
        };
        mbx.store(false, &all, &action).await.unwrap();
        let high = mbx.highest_mod_seq().await.unwrap();

        let set = SequenceSet(vec![SeqRange::new(1, 3)]);
        let action = StoreAction {
            mode: StoreMode::Add,
            silent: false,
            flags: vec![Flag::Seen],
            unchanged_since: Some(high - 1),
        };
        let outcome = mbx.store(false, &set, &action).await.unwrap();
        assert_eq!(outcome.stored.len(), 2);
        assert_eq!(outcome.failed, vec![3]);
    }

    #[tokio::test]
    async fn noop_store_does_not_bump_modseq() {
        let (_store, _session, mbx) = fixture().await;
        mbx.append(&[Flag::Seen], None, &msg("a", "x")).await.unwrap();
        let before = mbx.highest_mod_seq().await.unwrap();
        let set = SequenceSet(vec![SeqRange::single(1)]);
        let action = StoreAction {
            mode: StoreMode::Add,
            silent: false,
            flags: vec![Flag::Seen],
            unchanged_since: None,
        };
        mbx.store(false, &set, &action).await.unwrap();
        assert_eq!(mbx.highest_mod_seq().await.unwrap(), before);
    }

    #[tokio::test]
    async fn expunge_renumbers() {
        let (_store, _session, mbx) = fixture().await;
        for i in 0..4 {
            mbx.append(&[], None, &msg(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }
        let set = SequenceSet(vec![SeqRange::new(1, 4)]);
        let action = StoreAction {
            mode: StoreMode::Add,
            silent: true,
            flags: vec![Flag::Deleted],
            unchanged_since: None,
        };
        mbx.store(false, &set, &action).await.unwrap();

        // UID EXPUNGE of a subset: UID 3 sits at sequence 3
        let subset = SequenceSet(vec![SeqRange::single(3), SeqRange::single(9)]);
        let gone = mbx.expunge(Some(&subset)).await.unwrap();
        assert_eq!(gone, vec![3]);

        // remaining UIDs 1,2,4; expunge all: 1, 1, 1
        let gone = mbx.expunge(None).await.unwrap();
        assert_eq!(gone, vec![1, 1, 1]);
        assert_eq!(mbx.info().await.unwrap().num_messages, 0);
    }

    #[tokio::test]
    async fn search_evaluates_predicates() {
        let (_store, _session, mbx) = fixture().await;
        mbx.append(&[Flag::Seen], None, &msg("invoice", "pay me"))
            .await
            .unwrap();
        mbx.append(&[], None, &msg("hello", "spam and eggs"))
            .await
            .unwrap();

        let hits = mbx.search(&SearchOp::Unseen, false).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 2);

        let hits = mbx
            .search(&SearchOp::Subject("INVOICE".into()), false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 1);

        let hits = mbx
            .search(&SearchOp::Body("SPAM".into()), false)
            .await
            .unwrap();
        assert_eq!(hits[0].seq, 2);

        let op = SearchOp::And(vec![
            SearchOp::SentSince(crate::imap::lexer::parse_date("1-Jan-1994").unwrap()),
            SearchOp::Not(Box::new(SearchOp::Seen)),
        ]);
        let hits = mbx.search(&op, false).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 2);

        let hits = mbx
            .search(&SearchOp::Uid(SequenceSet(vec![SeqRange::new(2, 0)])), false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn copy_and_move() {
        let (_store, session, mbx) = fixture().await;
        session.create_mailbox("Archive", &[]).await.unwrap();
        for i in 0..3 {
            mbx.append(&[], None, &msg(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }
        let set = SequenceSet(vec![SeqRange::new(1, 2)]);
        let outcome = mbx.copy_messages(false, &set, "Archive").await.unwrap();
        assert_eq!(outcome.src_uids, vec![1, 2]);
        assert_eq!(outcome.dst_uids, vec![1, 2]);
        assert!(outcome.expunged_seqs.is_empty());

        let outcome = mbx.move_messages(false, &set, "Archive").await.unwrap();
        assert_eq!(outcome.expunged_seqs, vec![1, 1]);
        assert_eq!(mbx.info().await.unwrap().num_messages, 1);
        let archive = session.mailbox("Archive").await.unwrap();
        assert_eq!(archive.info().await.unwrap().num_messages, 4);
    }

    #[tokio::test]
    async fn rename_inbox_leaves_it_empty() {
        let (_store, session, mbx) = fixture().await;
        mbx.append(&[], None, &msg("a", "x")).await.unwrap();
        let before = mbx.info().await.unwrap();
        session.rename_mailbox("INBOX", "Old").await.unwrap();
        let inbox = session.mailbox("INBOX").await.unwrap();
        assert_eq!(inbox.info().await.unwrap().num_messages, 0);
        let old = session.mailbox("Old").await.unwrap();
        let old_info = old.info().await.unwrap();
        assert_eq!(old_info.num_messages, 1);
        // messages keep their (UID, UIDVALIDITY) identity at the new name
        assert_eq!(old_info.uid_validity, before.uid_validity);
        assert_eq!(old_info.uid_next, before.uid_next);
        assert_ne!(inbox.info().await.unwrap().uid_validity, before.uid_validity);
    }

    #[tokio::test]
    async fn deliver_reaches_inbox() {
        let (store, session, _mbx) = fixture().await;
        store.deliver("alice", "INBOX", &msg("new", "mail")).await.unwrap();
        let mbx = session.mailbox("INBOX").await.unwrap();
        let info = mbx.info().await.unwrap();
        assert_eq!(info.num_messages, 1);
        assert_eq!(info.num_recent, 1);
        mbx.close().await;
        assert_eq!(mbx.info().await.unwrap().num_recent, 0);
    }
}
