//! Cross-session update fan-out.
//!
//! Every logged-in session registers in a per-user entry; mailbox changes
//! walk the entry and queue EXISTS/EXPUNGE updates into each observing
//! session's outbound stream. Lock order is registry, then user entry, then
//! the session write half; never the reverse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::apns::ApnsHandle;
use super::session::SessionShared;
use crate::storage::{MailboxId, MailboxNotifier, PushDevice, UserId};

/// One queued unsolicited update. EXISTS carries the new message count,
/// EXPUNGE the (already renumbered) sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleUpdate {
    Exists(u32),
    Expunge(u32),
}

pub struct UserEntry {
    pub sessions: Mutex<Vec<Arc<SessionShared>>>,
}

#[derive(Default)]
pub struct UserRegistry {
    users: StdMutex<HashMap<UserId, Arc<UserEntry>>>,
}

impl UserRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn attach(&self, user: UserId, session: Arc<SessionShared>) {
        let entry = {
            let mut users = self.users.lock().expect("registry lock");
            users
                .entry(user)
                .or_insert_with(|| {
                    Arc::new(UserEntry {
                        sessions: Mutex::new(Vec::new()),
                    })
                })
                .clone()
        };
        entry.sessions.lock().await.push(session);
    }

    pub async fn detach(&self, user: UserId, session_id: &str) {
        let entry = {
            let users = self.users.lock().expect("registry lock");
            users.get(&user).cloned()
        };
        let mut empty = false;
        if let Some(entry) = entry {
            let mut sessions = entry.sessions.lock().await;
            sessions.retain(|s| s.id() != session_id);
            empty = sessions.is_empty();
        }
        if empty {
            let mut users = self.users.lock().expect("registry lock");
            if let Some(entry) = users.get(&user) {
                // Re-check under the registry lock; a login may have raced.
                if entry.sessions.try_lock().map(|s| s.is_empty()).unwrap_or(false) {
                    users.remove(&user);
                }
            }
        }
    }

    pub fn entry(&self, user: UserId) -> Option<Arc<UserEntry>> {
        self.users.lock().expect("registry lock").get(&user).cloned()
    }
}

pub struct Notifier {
    pub registry: Arc<UserRegistry>,
    pub apns: Option<ApnsHandle>,
}

impl Notifier {
    pub fn new(registry: Arc<UserRegistry>, apns: Option<ApnsHandle>) -> Arc<Self> {
        Arc::new(Self { registry, apns })
    }

    /// Fan an update from one session's command out to the user's other
    /// sessions observing the same mailbox. With `skip_self` unset the
    /// originating session receives the update too (on its next flush point).
    pub async fn broadcast(
        &self,
        user: UserId,
        mailbox_id: MailboxId,
        update: IdleUpdate,
        origin: &str,
        skip_self: bool,
    ) {
        let entry = match self.registry.entry(user) {
            Some(e) => e,
            None => return,
        };
        let sessions = entry.sessions.lock().await;
        for session in sessions.iter() {
            if skip_self && session.id() == origin {
                continue;
            }
            let observing = session
                .selected_mailbox()
                .map_or(false, |(id, _)| id == mailbox_id);
            if observing {
                session.enqueue_update(update).await;
            }
        }
    }

    /// Dispatch APNs wake-ups for a mailbox change, without blocking the
    /// storage path.
    pub fn push_devices(&self, devices: Vec<PushDevice>) {
        if devices.is_empty() {
            return;
        }
        if let Some(apns) = &self.apns {
            apns.dispatch(devices);
        }
    }
}

#[async_trait]
impl MailboxNotifier for Notifier {
    /// Store-driven notification: out-of-band mail arrived. Recomputes the
    /// message count once per observing session from its own mailbox handle.
    async fn notify(
        &self,
        user_id: UserId,
        mailbox_id: MailboxId,
        mailbox_name: &str,
        devices: Vec<PushDevice>,
    ) {
        tracing::debug!(user = user_id, mailbox = %mailbox_name, "notify.fanout");
        self.push_devices(devices);
        let entry = match self.registry.entry(user_id) {
            Some(e) => e,
            None => return,
        };
        let sessions = entry.sessions.lock().await;
        for session in sessions.iter() {
            let mailbox = match session.selected_mailbox() {
                Some((id, m)) if id == mailbox_id => m,
                _ => continue,
            };
            let count = match mailbox.info().await {
                Ok(info) => info.num_messages,
                Err(e) => {
                    tracing::warn!(session = session.id(), error = %e, "notify.count");
                    continue;
                }
            };
            session.enqueue_update(IdleUpdate::Exists(count)).await;
        }
    }
}

/// Coalesce a drained update queue: redundant EXISTS collapse to the last
/// one; EXPUNGE entries all survive, in order, because sequence numbers
/// renumber after each one is delivered.
pub fn coalesce(updates: Vec<IdleUpdate>) -> Vec<IdleUpdate> {
    let last_exists = updates
        .iter()
        .rposition(|u| matches!(u, IdleUpdate::Exists(_)));
    updates
        .into_iter()
        .enumerate()
        .filter(|(i, u)| match u {
            IdleUpdate::Exists(_) => Some(*i) == last_exists,
            IdleUpdate::Expunge(_) => true,
        })
        .map(|(_, u)| u)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_keeps_last_exists_and_all_expunges() {
        let updates = vec![
            IdleUpdate::Exists(4),
            IdleUpdate::Expunge(2),
            IdleUpdate::Exists(5),
            IdleUpdate::Expunge(2),
            IdleUpdate::Exists(6),
        ];
        assert_eq!(
            coalesce(updates),
            vec![
                IdleUpdate::Expunge(2),
                IdleUpdate::Expunge(2),
                IdleUpdate::Exists(6),
            ]
        );
    }

    #[test]
    fn coalesce_passes_lone_updates() {
        assert_eq!(
            coalesce(vec![IdleUpdate::Exists(1)]),
            vec![IdleUpdate::Exists(1)]
        );
        assert_eq!(coalesce(vec![]), vec![]);
    }
}
