//! Group-scoped broadcast of committed changes.
//!
//! The [`BroadcastHub`] keeps, per group, the set of observers that have
//! joined that group's channel. Each observer is a message-passing endpoint:
//! the hub holds the sending half of an unbounded channel and the observer's
//! session drains the receiving half.
//!
//! Delivery is at-most-once and live-only. An observer that joins late sees
//! nothing published before it joined; an observer whose channel has closed
//! is pruned on the next publish. Announcements for one task reach every
//! observer in version order: each group channel remembers the highest
//! version it announced per task and drops any late announcement of an older
//! one. That memory lives and dies with the channel, so a group nobody is
//! watching costs nothing.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use taskboard_proto::channel::BoardEvent;
use taskboard_proto::ids::{GroupId, ObserverId, TaskId, UserId};
use tokio::sync::mpsc;

/// An event as delivered to one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    /// Group channel the event was published on.
    pub group_id: GroupId,
    /// The change.
    pub event: BoardEvent,
}

/// Sending half of an observer's event queue.
#[derive(Debug, Clone)]
pub struct Observer {
    id: ObserverId,
    user: UserId,
    tx: mpsc::UnboundedSender<GroupEvent>,
}

impl Observer {
    /// Creates an observer for `user` with a fresh id, returning the handle
    /// to register with the hub and the receiver its session reads from.
    #[must_use]
    pub fn channel(user: UserId) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ObserverId::new(),
                user,
                tx,
            },
            rx,
        )
    }

    /// The observer's identifier.
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// The user this observer watches on behalf of.
    #[must_use]
    pub const fn user(&self) -> UserId {
        self.user
    }
}

/// Marker stored for a deleted task so no later update is announced.
const DELETED: u64 = u64::MAX;

/// Deleted tasks each channel keeps a marker for.
pub const TOMBSTONE_LIMIT: usize = 256;

/// Highest version announced per task on one channel.
#[derive(Default)]
struct VersionGate {
    announced: HashMap<TaskId, u64>,
    tombstones: VecDeque<TaskId>,
}

impl VersionGate {
    /// Returns `false` if the event announces a version no newer than one
    /// already announced for the same task, or a task already deleted.
    fn admit(&mut self, event: &BoardEvent) -> bool {
        match event {
            BoardEvent::TaskCreated(task) | BoardEvent::TaskUpdated(task) => {
                let last = self.announced.entry(task.id).or_insert(0);
                if task.version <= *last {
                    return false;
                }
                *last = task.version;
                true
            }
            BoardEvent::TaskDeleted { task_id, .. } => {
                if self.announced.insert(*task_id, DELETED) != Some(DELETED) {
                    self.tombstones.push_back(*task_id);
                }
                while self.tombstones.len() > TOMBSTONE_LIMIT {
                    if let Some(oldest) = self.tombstones.pop_front() {
                        self.announced.remove(&oldest);
                    }
                }
                true
            }
            BoardEvent::ActivityAppended(_) => true,
        }
    }
}

/// One group's observers and its version gate.
#[derive(Default)]
struct Channel {
    observers: HashMap<ObserverId, Observer>,
    gate: VersionGate,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<GroupId, Channel>,
}

/// Registry of group channels and their observers.
#[derive(Default)]
pub struct BroadcastHub {
    state: RwLock<HubState>,
}

impl BroadcastHub {
    /// Creates a hub with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `observer` to `group_id`'s channel. Membership checks are the
    /// caller's job.
    ///
    /// Returns `false` if the observer was already subscribed.
    pub fn subscribe(&self, observer: &Observer, group_id: GroupId) -> bool {
        let mut state = self.state.write();
        let added = state
            .channels
            .entry(group_id)
            .or_default()
            .observers
            .insert(observer.id, observer.clone())
            .is_none();
        drop(state);
        tracing::debug!(observer_id = %observer.id, group_id = %group_id, added, "observer subscribed");
        added
    }

    /// Removes an observer from one group. Returns `true` if it was there.
    pub fn unsubscribe(&self, observer_id: &ObserverId, group_id: &GroupId) -> bool {
        let mut state = self.state.write();
        let Some(channel) = state.channels.get_mut(group_id) else {
            return false;
        };
        let removed = channel.observers.remove(observer_id).is_some();
        if channel.observers.is_empty() {
            state.channels.remove(group_id);
        }
        drop(state);
        removed
    }

    /// Removes an observer from every group it joined. Returns the number of
    /// groups it was removed from.
    pub fn disconnect(&self, observer_id: &ObserverId) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        state.channels.retain(|_, channel| {
            if channel.observers.remove(observer_id).is_some() {
                removed += 1;
            }
            !channel.observers.is_empty()
        });
        drop(state);
        tracing::debug!(observer_id = %observer_id, groups = removed, "observer disconnected");
        removed
    }

    /// Removes every observer belonging to `user` from one group, e.g. after
    /// the user left it. Returns the number of observers removed.
    pub fn evict_user(&self, group_id: &GroupId, user: &UserId) -> usize {
        let mut state = self.state.write();
        let Some(channel) = state.channels.get_mut(group_id) else {
            return 0;
        };
        let before = channel.observers.len();
        channel.observers.retain(|_, observer| observer.user != *user);
        let removed = before - channel.observers.len();
        if channel.observers.is_empty() {
            state.channels.remove(group_id);
        }
        drop(state);
        removed
    }

    /// Announces `event` to every observer currently joined to `group_id`.
    ///
    /// Never blocks and never fails: observers whose channel has closed are
    /// pruned, and a stale task announcement is dropped. Returns the number
    /// of observers the event was handed to.
    pub fn publish(&self, group_id: &GroupId, event: BoardEvent) -> usize {
        let mut state = self.state.write();
        let Some(channel) = state.channels.get_mut(group_id) else {
            return 0;
        };

        if !channel.gate.admit(&event) {
            drop(state);
            tracing::debug!(group_id = %group_id, event = event.name(), "dropping stale announcement");
            return 0;
        }

        let message = GroupEvent {
            group_id: *group_id,
            event,
        };
        let mut delivered = 0;
        channel.observers.retain(|observer_id, observer| {
            if observer.tx.send(message.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::warn!(observer_id = %observer_id, group_id = %group_id, "observer channel closed, pruning");
                false
            }
        });
        if channel.observers.is_empty() {
            state.channels.remove(group_id);
        }
        drop(state);

        tracing::debug!(group_id = %group_id, event = message.event.name(), delivered, "event published");
        delivered
    }

    /// Number of observers joined to a group.
    #[must_use]
    pub fn subscriber_count(&self, group_id: &GroupId) -> usize {
        self.state
            .read()
            .channels
            .get(group_id)
            .map_or(0, |channel| channel.observers.len())
    }

    /// Number of per-task version entries held across all channels.
    #[must_use]
    pub fn tracked_tasks(&self) -> usize {
        self.state
            .read()
            .channels
            .values()
            .map(|channel| channel.gate.announced.len())
            .sum()
    }
}
