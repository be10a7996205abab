//! Group registry.
//!
//! Maintains the in-memory directory of groups and their members. Group
//! membership gates every task operation and every channel join, so the
//! HTTP layer consults [`GroupRegistry::is_member`] before reaching the
//! coordinator or the hub.
//!
//! Groups are ephemeral, same as tasks in the in-memory store.

use std::collections::HashMap;

use taskboard_proto::group::Group;
use taskboard_proto::ids::{GroupId, UserId};
use tokio::sync::RwLock;

/// Maximum number of groups the registry will hold.
const MAX_GROUPS: usize = 10_000;

/// Maximum group name length in characters.
pub const MAX_GROUP_NAME_LENGTH: usize = 64;

/// Length of an invite token in hex characters.
const INVITE_TOKEN_LEN: usize = 16;

/// Errors that can occur during group registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The group name is empty or too long.
    #[error("group name must be 1-{MAX_GROUP_NAME_LENGTH} characters")]
    InvalidName,
    /// The registry has reached its maximum capacity.
    #[error("group registry is full (max {MAX_GROUPS} groups)")]
    CapacityReached,
    /// No group matches the id or invite token.
    #[error("group not found")]
    GroupNotFound,
    /// The user does not belong to the group.
    #[error("not a member of this group")]
    NotMember,
}

/// What happened to a group when a member left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The member left; the group lives on under `owner`.
    Left {
        /// Owner after the departure.
        owner: UserId,
    },
    /// The last member left and the group was removed.
    Dissolved,
}

/// In-memory directory of groups.
///
/// Thread-safe via [`RwLock`].
pub struct GroupRegistry {
    groups: RwLock<HashMap<GroupId, Group>>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a group owned by `creator`, who becomes its first member.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] or
    /// [`RegistryError::CapacityReached`].
    pub async fn create(&self, name: &str, creator: UserId) -> Result<Group, RegistryError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_LENGTH {
            return Err(RegistryError::InvalidName);
        }

        let mut groups = self.groups.write().await;
        if groups.len() >= MAX_GROUPS {
            return Err(RegistryError::CapacityReached);
        }

        let group = Group {
            id: GroupId::new(),
            name: name.to_string(),
            creator,
            members: vec![creator],
            invite_token: unique_token(&groups, invite_token),
        };
        groups.insert(group.id, group.clone());
        drop(groups);

        tracing::info!(group_id = %group.id, creator = %creator, "group created");
        Ok(group)
    }

    /// Adds `user` to the group holding `token`. Joining a group the user
    /// already belongs to changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::GroupNotFound`] for an unknown token.
    pub async fn join_by_token(&self, token: &str, user: UserId) -> Result<Group, RegistryError> {
        let token = token.trim();
        let mut groups = self.groups.write().await;
        let group = groups
            .values_mut()
            .find(|g| g.invite_token == token)
            .ok_or(RegistryError::GroupNotFound)?;
        let added = !group.has_member(&user);
        if added {
            group.members.push(user);
        }
        let joined = group.clone();
        drop(groups);

        tracing::info!(group_id = %joined.id, user = %user, added, "member joined group");
        Ok(joined)
    }

    /// Removes `user` from a group. If the owner leaves, ownership moves to
    /// the longest-standing remaining member; if nobody remains, the group
    /// is removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::GroupNotFound`] or [`RegistryError::NotMember`].
    pub async fn leave(
        &self,
        group_id: &GroupId,
        user: &UserId,
    ) -> Result<LeaveOutcome, RegistryError> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(group_id).ok_or(RegistryError::GroupNotFound)?;
        let Some(pos) = group.members.iter().position(|m| m == user) else {
            return Err(RegistryError::NotMember);
        };
        group.members.remove(pos);

        let outcome = match group.members.first().copied() {
            None => {
                groups.remove(group_id);
                LeaveOutcome::Dissolved
            }
            Some(first) => {
                if group.creator == *user {
                    group.creator = first;
                }
                LeaveOutcome::Left {
                    owner: group.creator,
                }
            }
        };
        drop(groups);

        tracing::info!(group_id = %group_id, user = %user, outcome = ?outcome, "member left group");
        Ok(outcome)
    }

    /// Returns every group `user` belongs to.
    pub async fn groups_for(&self, user: &UserId) -> Vec<Group> {
        let groups = self.groups.read().await;
        let mut mine: Vec<Group> = groups
            .values()
            .filter(|g| g.has_member(user))
            .cloned()
            .collect();
        mine.sort_by_key(|g| g.id);
        mine
    }

    /// Returns `true` if the group exists and `user` belongs to it.
    pub async fn is_member(&self, group_id: &GroupId, user: &UserId) -> bool {
        let groups = self.groups.read().await;
        groups.get(group_id).is_some_and(|g| g.has_member(user))
    }

    /// Returns a group by id.
    pub async fn get(&self, group_id: &GroupId) -> Option<Group> {
        self.groups.read().await.get(group_id).cloned()
    }
}

/// Draws tokens from `generate` until one is not held by any group.
fn unique_token(groups: &HashMap<GroupId, Group>, mut generate: impl FnMut() -> String) -> String {
    loop {
        let token = generate();
        if !groups.values().any(|g| g.invite_token == token) {
            return token;
        }
        tracing::debug!("invite token collision, drawing again");
    }
}

fn invite_token() -> String {
    let mut token = uuid::Uuid::new_v4().simple().to_string();
    token.truncate(INVITE_TOKEN_LEN);
    token
}
