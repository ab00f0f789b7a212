use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use inkwell_db::{Database, Result, StoreError};
use inkwell_types::api::{ContainerUnread, GroupUnread, UnreadSummary};
use inkwell_types::events::BusEvent;
use inkwell_types::models::ContainerId;

/// Cached unread count of one user in one container.
///
/// `as_of` is the highest sequence the count had seen when it was computed.
/// Appends at or below it are already included and must not be counted twice.
#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    as_of: u64,
}

/// Entries of one container, keyed by user.
type Shard = Arc<Mutex<HashMap<Uuid, Entry>>>;

/// Derived unread counts, kept per `(user, container)`.
///
/// Entries are computed lazily from the read position and the message store,
/// then maintained from the same events the bus carries. Group totals are
/// never stored; they are summed from channel entries at read time.
///
/// Each container has its own lock. The outer map is only written when a
/// container is seen for the first time. An entry exists only for a current
/// member: it is inserted after a membership check under the container lock
/// and dropped under the same lock when the member leaves.
pub struct UnreadAggregator {
    db: Arc<Database>,
    shards: RwLock<HashMap<ContainerId, Shard>>,
}

fn lock(shard: &Shard) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UnreadAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, shards: RwLock::new(HashMap::new()) }
    }

    fn existing(&self, container: ContainerId) -> Option<Shard> {
        self.shards.read().unwrap_or_else(PoisonError::into_inner).get(&container).cloned()
    }

    fn shard(&self, container: ContainerId) -> Shard {
        if let Some(shard) = self.existing(container) {
            return shard;
        }
        self.shards.write().unwrap_or_else(PoisonError::into_inner).entry(container).or_default().clone()
    }

    /// Folds one committed mutation into the cache.
    pub fn apply(&self, event: &BusEvent) -> Result<()> {
        match event {
            BusEvent::MessageAppended { message } => {
                if let Some(shard) = self.existing(message.container) {
                    for (user_id, entry) in lock(&shard).iter_mut() {
                        if *user_id != message.author_id && message.sequence > entry.as_of {
                            entry.count += 1;
                        }
                    }
                }
                Ok(())
            }
            BusEvent::MessageDeleted { message, .. } => {
                if let Some(shard) = self.existing(message.container) {
                    lock(&shard).clear();
                }
                Ok(())
            }
            BusEvent::ReadAdvanced { user_id, container, position } => {
                let shard = self.shard(*container);
                let mut users = lock(&shard);
                match self.db.unread_tail(*container, *user_id, *position) {
                    Ok(tail) => {
                        users.insert(*user_id, Entry { count: tail.count, as_of: tail.as_of });
                        Ok(())
                    }
                    Err(e) => {
                        users.remove(user_id);
                        Err(e)
                    }
                }
            }
            BusEvent::MembershipChanged { group_id, user_id, role: None, .. } => {
                for channel in self.db.list_channels(*group_id)? {
                    if let Some(shard) = self.existing(ContainerId::Channel(channel.id)) {
                        lock(&shard).remove(user_id);
                    }
                }
                debug!("Dropped unread entries of {} in group {}", user_id, group_id);
                Ok(())
            }
            BusEvent::MembershipChanged { .. } | BusEvent::ReactionChanged { .. } => Ok(()),
        }
    }

    /// Unread count of `user_id` in `container`. `None` when the user is not a
    /// participant or member, or the container does not exist.
    ///
    /// A cached entry is served without touching the store.
    pub fn unread(&self, user_id: Uuid, container: ContainerId) -> Result<Option<u64>> {
        let shard = self.shard(container);
        let mut users = lock(&shard);
        if let Some(entry) = users.get(&user_id) {
            return Ok(Some(entry.count));
        }

        // Checked under the container lock, so a removal committed before
        // this point is seen here and one committed after it finds the entry.
        match self.db.is_container_member(container, user_id) {
            Ok(true) => {}
            Ok(false) | Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        // No append can be applied between the snapshot and the insert.
        let position = self.db.read_position(user_id, container)?;
        let tail = self.db.unread_tail(container, user_id, position)?;
        users.insert(user_id, Entry { count: tail.count, as_of: tail.as_of });
        Ok(Some(tail.count))
    }

    /// Per-container counts for every conversation and channel of the user,
    /// per-group sums of channel counts, and the overall total.
    pub fn summary(&self, user_id: Uuid) -> Result<UnreadSummary> {
        let mut per_container = Vec::new();
        let mut per_group: BTreeMap<Uuid, u64> = BTreeMap::new();

        for (group, _) in self.db.groups_for_user(user_id)? {
            per_group.insert(group.id, 0);
        }

        for conversation in self.db.conversations_for_user(user_id)? {
            let container = ContainerId::Conversation(conversation.id);
            if let Some(unread) = self.unread(user_id, container)? {
                per_container.push(ContainerUnread { container, group_id: None, unread });
            }
        }

        for channel in self.db.channels_for_user(user_id)? {
            let container = ContainerId::Channel(channel.id);
            let Some(unread) = self.unread(user_id, container)? else {
                warn!("{} left group {} during a summary", user_id, channel.group_id);
                continue;
            };
            *per_group.entry(channel.group_id).or_default() += unread;
            per_container.push(ContainerUnread { container, group_id: Some(channel.group_id), unread });
        }

        let total = per_container.iter().map(|c| c.unread).sum();
        Ok(UnreadSummary {
            per_container,
            per_group: per_group
                .into_iter()
                .map(|(group_id, unread)| GroupUnread { group_id, unread })
                .collect(),
            total,
        })
    }

    /// Number of cached entries, for diagnostics.
    pub fn cached_entries(&self) -> usize {
        let shards: Vec<Shard> = self.shards.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        shards.iter().map(|shard| lock(shard).len()).sum()
    }
}
