/// Channel presence membership.
///
/// Reconciles SYNC pages and individual presence events into one map
/// keyed by `clientId:connectionId`. Returned event lists are what the
/// channel re-emits, in order; the map itself never emits.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::message::{PresenceAction, PresenceMessage};

pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Member keys confirmed by the sync cycle in progress.
    sync_confirmed: Option<HashSet<String>>,
}

impl Default for PresenceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceMap {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            sync_confirmed: None,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, key: &str) -> Option<&PresenceMessage> {
        self.members.get(key)
    }

    pub fn members(&self) -> impl Iterator<Item = &PresenceMessage> {
        self.members.values()
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_confirmed.is_some()
    }

    /// Merge one SYNC page. When `is_last_page`, members known before
    /// the sync but absent from the union of pages are synthesized as
    /// LEAVE and removed.
    pub fn apply_sync(
        &mut self,
        page: Vec<PresenceMessage>,
        is_last_page: bool,
    ) -> Vec<PresenceMessage> {
        if self.sync_confirmed.is_none() {
            debug!(existing = self.members.len(), "presence sync starting");
            self.sync_confirmed = Some(HashSet::new());
        }

        let mut emitted = Vec::new();
        for member in page {
            let key = member.member_key();
            if let Some(confirmed) = self.sync_confirmed.as_mut() {
                confirmed.insert(key.clone());
            }
            match member.action {
                PresenceAction::Leave | PresenceAction::Absent => {
                    if self.members.remove(&key).is_some() {
                        let mut leave = member.clone();
                        leave.action = PresenceAction::Leave;
                        emitted.push(leave);
                    }
                }
                PresenceAction::Present | PresenceAction::Enter | PresenceAction::Update => {
                    let newcomer = !self.members.contains_key(&key);
                    let mut stored = member.clone();
                    stored.action = PresenceAction::Present;
                    self.members.insert(key, stored);

                    let mut event = member;
                    event.action = if newcomer {
                        PresenceAction::Enter
                    } else {
                        PresenceAction::Update
                    };
                    emitted.push(event);
                }
            }
        }

        if is_last_page {
            emitted.extend(self.finish_sync());
        }
        emitted
    }

    /// Apply one presence event received outside (or during) a sync.
    pub fn apply_message(&mut self, message: PresenceMessage) -> Option<PresenceMessage> {
        let key = message.member_key();
        // Live events arriving mid-sync confirm the member too.
        if let Some(confirmed) = self.sync_confirmed.as_mut() {
            confirmed.insert(key.clone());
        }

        match message.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                let mut stored = message.clone();
                stored.action = PresenceAction::Present;
                self.members.insert(key, stored);
                Some(message)
            }
            PresenceAction::Leave => {
                if self.members.remove(&key).is_some() {
                    Some(message)
                } else {
                    // Leave for an unknown member carries no state change.
                    None
                }
            }
            PresenceAction::Absent => None,
        }
    }

    /// Presence continuity lost: every member leaves.
    pub fn on_channel_detached_or_lost(&mut self) -> Vec<PresenceMessage> {
        self.sync_confirmed = None;
        let mut leaves: Vec<PresenceMessage> = self
            .members
            .drain()
            .map(|(_, mut member)| {
                member.action = PresenceAction::Leave;
                member
            })
            .collect();
        leaves.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        leaves
    }

    fn finish_sync(&mut self) -> Vec<PresenceMessage> {
        let confirmed = match self.sync_confirmed.take() {
            Some(confirmed) => confirmed,
            None => return Vec::new(),
        };

        let stale: Vec<String> = self
            .members
            .keys()
            .filter(|key| !confirmed.contains(*key))
            .cloned()
            .collect();

        if !stale.is_empty() {
            debug!(count = stale.len(), "presence sync complete, removing stale members");
        }

        let mut leaves = Vec::new();
        for key in stale {
            if let Some(mut member) = self.members.remove(&key) {
                member.action = PresenceAction::Leave;
                leaves.push(member);
            }
        }
        leaves.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        leaves
    }
}
