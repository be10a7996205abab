//! Groups: the scope that owns tasks and a live channel.

use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, UserId};

/// A group of users sharing one board.
///
/// `members` is never empty while the group exists; `creator` is always a
/// member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group identifier.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Current owner. Transfers when the owner leaves.
    pub creator: UserId,
    /// Members in join order.
    pub members: Vec<UserId>,
    /// Shareable token used to join.
    pub invite_token: String,
}

impl Group {
    /// Returns `true` if `user` is a member.
    #[must_use]
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

/// Body of a group creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    /// Display name.
    pub name: String,
}

/// Body of a join-by-invite request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroupRequest {
    /// Invite token of the group to join.
    pub token: String,
}
