//! The store boundary.
//!
//! The protocol engine never touches persistent state directly: everything
//! goes through these traits. A production deployment plugs its own backend
//! in; the bundled [`in_memory`] store backs tests and development setups.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::imap::types::{Flag, SearchOp, SequenceSet, StoreAction};

pub type UserId = u64;
pub type MailboxId = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel for LOGIN/AUTHENTICATE failure; reported as `NO bad credentials`.
    #[error("bad credentials")]
    BadCredentials,
    #[error("no such mailbox {0}")]
    NoSuchMailbox(String),
    #[error("mailbox {0} already exists")]
    AlreadyExists(String),
    /// Semantic rejection, reported as `NO`.
    #[error("{0}")]
    Rejected(String),
    /// Server fault, reported as `BAD`.
    #[error("{0}")]
    Internal(String),
}

/// SPECIAL-USE and LIST attributes a mailbox may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxAttr {
    NoSelect,
    HasChildren,
    HasNoChildren,
    Drafts,
    Sent,
    Junk,
    Archive,
    Trash,
    Flagged,
    All,
}

impl MailboxAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxAttr::NoSelect => "\\Noselect",
            MailboxAttr::HasChildren => "\\HasChildren",
            MailboxAttr::HasNoChildren => "\\HasNoChildren",
            MailboxAttr::Drafts => "\\Drafts",
            MailboxAttr::Sent => "\\Sent",
            MailboxAttr::Junk => "\\Junk",
            MailboxAttr::Archive => "\\Archive",
            MailboxAttr::Trash => "\\Trash",
            MailboxAttr::Flagged => "\\Flagged",
            MailboxAttr::All => "\\All",
        }
    }

    pub fn special_use(&self) -> bool {
        !matches!(
            self,
            MailboxAttr::NoSelect | MailboxAttr::HasChildren | MailboxAttr::HasNoChildren
        )
    }
}

#[derive(Debug, Clone)]
pub struct MailboxSummary {
    pub name: String,
    pub attrs: Vec<MailboxAttr>,
}

#[derive(Debug, Clone)]
pub struct MailboxInfo {
    pub name: String,
    pub num_messages: u32,
    pub num_recent: u32,
    pub num_unseen: u32,
    /// Sequence number of the first unseen message, 0 when all are seen.
    pub first_unseen_seq: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub highest_mod_seq: u64,
    pub attrs: Vec<MailboxAttr>,
}

/// A device registered through XAPPLEPUSHSERVICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDevice {
    /// Hex form of the 32-byte APNs device token.
    pub token: String,
    pub account_id: String,
}

#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub seq: u32,
    pub uid: u32,
    pub mod_seq: u64,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<Utc>,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub meta: MessageMeta,
    /// Raw RFC 822 bytes; only populated when the fetch asked for content.
    pub body: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOutcome {
    /// Post-update metadata of each message the store touched.
    pub stored: Vec<MessageMeta>,
    /// Messages skipped because their MODSEQ exceeded UNCHANGEDSINCE;
    /// sequence numbers or UIDs depending on the command's uid mode.
    pub failed: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOutcome {
    pub uid_validity: u32,
    pub src_uids: Vec<u32>,
    pub dst_uids: Vec<u32>,
    /// For MOVE: source sequence numbers in delivery order, renumbered after
    /// each prior removal per the EXPUNGE rules.
    pub expunged_seqs: Vec<u32>,
}

/// Cross-session change callback, registered once at startup. Implemented by
/// the engine's notifier; invoked by the store when mail arrives out of band.
#[async_trait]
pub trait MailboxNotifier: Send + Sync {
    async fn notify(
        &self,
        user_id: UserId,
        mailbox_id: MailboxId,
        mailbox_name: &str,
        devices: Vec<PushDevice>,
    );
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserId, Box<dyn StoreSession>), StoreError>;

    fn register_notifier(&self, notifier: Arc<dyn MailboxNotifier>);
}

#[async_trait]
pub trait StoreSession: Send + Sync {
    async fn mailboxes(&self) -> Result<Vec<MailboxSummary>, StoreError>;
    async fn mailbox(&self, name: &str) -> Result<Arc<dyn Mailbox>, StoreError>;
    async fn create_mailbox(&self, name: &str, attrs: &[MailboxAttr]) -> Result<(), StoreError>;
    async fn delete_mailbox(&self, name: &str) -> Result<(), StoreError>;
    async fn rename_mailbox(&self, from: &str, to: &str) -> Result<(), StoreError>;
    async fn register_push_device(
        &self,
        mailbox: &str,
        device: PushDevice,
    ) -> Result<(), StoreError>;
    async fn push_devices(&self, mailbox: &str) -> Vec<PushDevice>;
    async fn close(&self);
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    fn id(&self) -> MailboxId;

    async fn info(&self) -> Result<MailboxInfo, StoreError>;

    /// Returns the UID assigned to the new message.
    async fn append(
        &self,
        flags: &[Flag],
        date: Option<DateTime<FixedOffset>>,
        content: &[u8],
    ) -> Result<u32, StoreError>;

    /// Evaluate a search tree; matches come back in mailbox order.
    async fn search(&self, op: &SearchOp, uid_mode: bool) -> Result<Vec<MessageMeta>, StoreError>;

    async fn fetch(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        changed_since: Option<u64>,
        need_body: bool,
    ) -> Result<Vec<FetchedMessage>, StoreError>;

    /// Remove `\Deleted` messages (restricted to `uid_seqs` when given) and
    /// return the expunged sequence numbers, renumbered in delivery order.
    async fn expunge(&self, uid_seqs: Option<&SequenceSet>) -> Result<Vec<u32>, StoreError>;

    async fn store(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        action: &StoreAction,
    ) -> Result<StoreOutcome, StoreError>;

    async fn move_messages(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
    ) -> Result<CopyOutcome, StoreError>;

    async fn copy_messages(
        &self,
        uid_mode: bool,
        seqs: &SequenceSet,
        dst: &str,
    ) -> Result<CopyOutcome, StoreError>;

    async fn highest_mod_seq(&self) -> Result<u64, StoreError>;

    async fn close(&self);
}
