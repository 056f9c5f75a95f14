use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};

/// One range of a sequence set, stored normalized: `min <= max` whenever both
/// ends are concrete. The value 0 encodes `*` (the highest sequence number or
/// UID in the mailbox) and may only appear in `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub min: u32,
    pub max: u32,
}

impl SeqRange {
    pub fn new(a: u32, b: u32) -> Self {
        if a != 0 && b != 0 && a > b {
            Self { min: b, max: a }
        } else if a == 0 {
            // "*:n" is the same set as "n:*"
            Self { min: b, max: a }
        } else {
            Self { min: a, max: b }
        }
    }

    pub fn single(n: u32) -> Self {
        Self { min: n, max: n }
    }
}

/// A full sequence set: `1:5,8,20:*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSet(pub Vec<SeqRange>);

impl SequenceSet {
    pub fn single(n: u32) -> Self {
        Self(vec![SeqRange::single(n)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Membership test against a mailbox whose highest number is `highest`.
    /// `*` matches the highest number; the range `m:*` matches everything at
    /// or above `min(m, highest)` per RFC 3501 (so `9:*` matches 7 when the
    /// mailbox only holds 7 messages).
    pub fn contains(&self, n: u32, highest: u32) -> bool {
        self.0.iter().any(|r| {
            let min = if r.min == 0 { highest } else { r.min };
            let max = if r.max == 0 { highest } else { r.max };
            let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
            n >= lo && n <= hi
        })
    }

    pub fn contains_star(&self) -> bool {
        self.0.iter().any(|r| r.min == 0 || r.max == 0)
    }

    /// Collect the members of this set given the mailbox's highest number,
    /// ascending and deduplicated.
    pub fn expand(&self, highest: u32) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::new();
        for r in &self.0 {
            let min = if r.min == 0 { highest } else { r.min };
            let max = if r.max == 0 { highest } else { r.max };
            let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
            for n in lo..=hi.min(highest) {
                out.push(n);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Build the most compact set covering `values` (must be sorted ascending).
    pub fn from_sorted(values: &[u32]) -> Self {
        let mut ranges: Vec<SeqRange> = Vec::new();
        for &v in values {
            match ranges.last_mut() {
                Some(r) if r.max + 1 == v => r.max = v,
                Some(r) if r.max == v => (),
                _ => ranges.push(SeqRange::single(v)),
            }
        }
        Self(ranges)
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            let end = |n: u32| -> String {
                if n == 0 {
                    "*".into()
                } else {
                    n.to_string()
                }
            };
            if r.min == r.max {
                write!(f, "{}", end(r.min))?;
            } else {
                write!(f, "{}:{}", end(r.min), end(r.max))?;
            }
        }
        Ok(())
    }
}

/// A message flag. System flags are the closed set of RFC 3501 §2.3.2;
/// everything else is a keyword atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flag {
    Answered,
    Flagged,
    Deleted,
    Seen,
    Draft,
    Keyword(String),
}

impl Flag {
    pub fn system(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ANSWERED" => Some(Flag::Answered),
            "FLAGGED" => Some(Flag::Flagged),
            "DELETED" => Some(Flag::Deleted),
            "SEEN" => Some(Flag::Seen),
            "DRAFT" => Some(Flag::Draft),
            _ => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Keyword(kw) => write!(f, "{}", kw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Replace,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreAction {
    pub mode: StoreMode,
    pub silent: bool,
    pub flags: Vec<Flag>,
    pub unchanged_since: Option<u64>,
}

/// Named part of a BODY[] section, after the numeric part path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionName {
    /// `BODY[]` or `BODY[1.2]`: the full (sub)message.
    Full,
    Header,
    HeaderFields,
    HeaderFieldsNot,
    Text,
    Mime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub parts: Vec<u16>,
    pub name: SectionName,
    /// Header names for HEADER.FIELDS / HEADER.FIELDS.NOT.
    pub fields: Vec<String>,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            parts: Vec::new(),
            name: SectionName::Full,
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItemType {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Uid,
    BodyStructure,
    Body,
    ModSeq,
}

/// One parsed fetch item: `BODY.PEEK[1.HEADER.FIELDS (From To)]<0.2048>`
/// carries type Body, peek, a section and a partial range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchItem {
    pub item: FetchItemType,
    pub peek: bool,
    pub section: Option<Section>,
    pub partial: Option<(u32, u32)>,
}

impl FetchItem {
    pub fn of(item: FetchItemType) -> Self {
        Self {
            item,
            peek: false,
            section: None,
            partial: None,
        }
    }

    /// BODY-class items carry (potentially large) literals and are reordered
    /// to the end of the FETCH response line.
    pub fn is_body(&self) -> bool {
        matches!(
            self.item,
            FetchItemType::Body
                | FetchItemType::BodyStructure
                | FetchItemType::Rfc822
                | FetchItemType::Rfc822Header
                | FetchItemType::Rfc822Text
        )
    }
}

/// The ALL/FAST/FULL macros of RFC 3501 §6.4.5, only legal as the sole
/// top-level fetch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMacro {
    All,
    Fast,
    Full,
}

impl FetchMacro {
    pub fn expand(self) -> Vec<FetchItem> {
        use FetchItemType::*;
        let base = match self {
            FetchMacro::Fast => vec![Flags, InternalDate, Rfc822Size],
            FetchMacro::All => vec![Flags, InternalDate, Rfc822Size, Envelope],
            FetchMacro::Full => vec![Flags, InternalDate, Rfc822Size, Envelope, Body],
        };
        base.into_iter().map(FetchItem::of).collect()
    }
}

/// A search key tree. Leaves are predicates; AND/OR/NOT combine them.
/// AND is both the implicit concatenation rule and the parenthesized list.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOp {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    Keyword(String),
    Unkeyword(String),
    SeqSet(SequenceSet),
    Uid(SequenceSet),
    Bcc(String),
    Body(String),
    Cc(String),
    From(String),
    Header(String, String),
    Subject(String),
    Text(String),
    To(String),
    Before(DateTime<Utc>),
    On(DateTime<Utc>),
    Since(DateTime<Utc>),
    SentBefore(DateTime<Utc>),
    SentOn(DateTime<Utc>),
    SentSince(DateTime<Utc>),
    Larger(u32),
    Smaller(u32),
    ModSeq(u64),
    And(Vec<SearchOp>),
    Or(Box<SearchOp>, Box<SearchOp>),
    Not(Box<SearchOp>),
}

impl SearchOp {
    /// Whether the tree mentions MODSEQ anywhere; a match switches the
    /// session into CONDSTORE reporting.
    pub fn references_modseq(&self) -> bool {
        match self {
            SearchOp::ModSeq(_) => true,
            SearchOp::And(kids) => kids.iter().any(|k| k.references_modseq()),
            SearchOp::Or(a, b) => a.references_modseq() || b.references_modseq(),
            SearchOp::Not(k) => k.references_modseq(),
            _ => false,
        }
    }
}

/// QRESYNC parameters attached to SELECT/EXAMINE (RFC 7162 §3.2.5).
#[derive(Debug, Clone, PartialEq)]
pub struct QresyncParams {
    pub uid_validity: u32,
    pub mod_seq: u64,
    pub known_uids: Option<SequenceSet>,
    pub seq_match: Option<(SequenceSet, SequenceSet)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSelectOpt {
    Subscribed,
    Remote,
    RecursiveMatch,
    SpecialUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListReturnOpt {
    Subscribed,
    Children,
    SpecialUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModSeq,
}

/// RFC 4731 SEARCH RETURN options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchReturnOpt {
    Min,
    Max,
    All,
    Count,
}

/// XAPPLEPUSHSERVICE parameters, free key order on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplePushParams {
    pub mailboxes: Vec<String>,
    pub version: u32,
    pub account_id: String,
    pub device_token: String,
    pub subtopic: String,
}

/// A fully parsed command. `uid` records a `UID ` prefix on COPY, FETCH,
/// STORE, SEARCH, MOVE or EXPUNGE.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub tag: String,
    pub uid: bool,
    pub body: CommandBody,
}

impl Command {
    pub fn name(&self) -> &'static str {
        self.body.name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Capability,
    Noop,
    Logout,
    Check,
    Id(Vec<(String, Option<String>)>),
    Compress,
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        username: String,
        password: String,
    },
    Enable {
        capabilities: Vec<String>,
    },
    Select {
        mailbox: String,
        condstore: bool,
        qresync: Option<QresyncParams>,
    },
    Examine {
        mailbox: String,
        condstore: bool,
        qresync: Option<QresyncParams>,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        select_opts: Vec<ListSelectOpt>,
        reference: String,
        pattern: String,
        return_opts: Vec<ListReturnOpt>,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        date: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    },
    Idle,
    Close,
    Expunge {
        /// Set on `UID EXPUNGE` (RFC 4315): restricts the expunge to these UIDs.
        uid_seqs: Option<SequenceSet>,
    },
    Search {
        return_opts: Vec<SearchReturnOpt>,
        op: SearchOp,
    },
    Fetch {
        seqs: SequenceSet,
        items: Vec<FetchItem>,
        changed_since: Option<u64>,
        vanished: bool,
    },
    Store {
        seqs: SequenceSet,
        action: StoreAction,
    },
    Copy {
        seqs: SequenceSet,
        mailbox: String,
    },
    Move {
        seqs: SequenceSet,
        mailbox: String,
    },
    XApplePushService(ApplePushParams),
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Capability => "CAPABILITY",
            CommandBody::Noop => "NOOP",
            CommandBody::Logout => "LOGOUT",
            CommandBody::Check => "CHECK",
            CommandBody::Id(_) => "ID",
            CommandBody::Compress => "COMPRESS",
            CommandBody::Login { .. } => "LOGIN",
            CommandBody::Authenticate { .. } => "AUTHENTICATE",
            CommandBody::Enable { .. } => "ENABLE",
            CommandBody::Select { .. } => "SELECT",
            CommandBody::Examine { .. } => "EXAMINE",
            CommandBody::Create { .. } => "CREATE",
            CommandBody::Delete { .. } => "DELETE",
            CommandBody::Rename { .. } => "RENAME",
            CommandBody::Subscribe { .. } => "SUBSCRIBE",
            CommandBody::Unsubscribe { .. } => "UNSUBSCRIBE",
            CommandBody::List { .. } => "LIST",
            CommandBody::Lsub { .. } => "LSUB",
            CommandBody::Status { .. } => "STATUS",
            CommandBody::Append { .. } => "APPEND",
            CommandBody::Idle => "IDLE",
            CommandBody::Close => "CLOSE",
            CommandBody::Expunge { .. } => "EXPUNGE",
            CommandBody::Search { .. } => "SEARCH",
            CommandBody::Fetch { .. } => "FETCH",
            CommandBody::Store { .. } => "STORE",
            CommandBody::Copy { .. } => "COPY",
            CommandBody::Move { .. } => "MOVE",
            CommandBody::XApplePushService(_) => "XAPPLEPUSHSERVICE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_range_normalizes() {
        assert_eq!(SeqRange::new(9, 2), SeqRange { min: 2, max: 9 });
        assert_eq!(SeqRange::new(2, 9), SeqRange { min: 2, max: 9 });
        // '*' stays in max
        assert_eq!(SeqRange::new(0, 4), SeqRange { min: 4, max: 0 });
        assert_eq!(SeqRange::new(4, 0), SeqRange { min: 4, max: 0 });
    }

    #[test]
    fn seq_set_contains_star_semantics() {
        let set = SequenceSet(vec![SeqRange { min: 9, max: 0 }]);
        // 9:* in a 7-message mailbox matches 7..=9
        assert!(set.contains(7, 7));
        assert!(!set.contains(6, 7));
        assert!(set.contains(9, 7));
    }

    #[test]
    fn seq_set_expand_and_compact() {
        let set = SequenceSet(vec![
            SeqRange::new(1, 3),
            SeqRange::single(3),
            SeqRange::new(5, 6),
        ]);
        assert_eq!(set.expand(10), vec![1, 2, 3, 5, 6]);
        let compact = SequenceSet::from_sorted(&[1, 2, 3, 5, 6]);
        assert_eq!(compact.to_string(), "1:3,5:6");
    }

    #[test]
    fn seq_set_display_star() {
        let set = SequenceSet(vec![SeqRange { min: 4, max: 0 }, SeqRange::single(1)]);
        assert_eq!(set.to_string(), "4:*,1");
    }

    #[test]
    fn fetch_macro_expansion() {
        let full = FetchMacro::Full.expand();
        assert_eq!(full.len(), 5);
        assert!(full.iter().any(|i| i.item == FetchItemType::Body));
        assert!(FetchMacro::Fast
            .expand()
            .iter()
            .all(|i| i.item != FetchItemType::Envelope));
    }

    #[test]
    fn modseq_detection_recurses() {
        let op = SearchOp::And(vec![
            SearchOp::Seen,
            SearchOp::Not(Box::new(SearchOp::Or(
                Box::new(SearchOp::All),
                Box::new(SearchOp::ModSeq(42)),
            ))),
        ]);
        assert!(op.references_modseq());
        assert!(!SearchOp::Seen.references_modseq());
    }
}
