//! Live channel wire protocol.
//!
//! Defines the [`ChannelMessage`] enum that is postcard-encoded and sent
//! over WebSocket binary frames between board clients and the server.
//!
//! A session opens with `Hello`, answered by `Welcome`. The client then
//! joins and leaves group channels; the server pushes `Event` frames only
//! for groups the connection has explicitly joined. Delivery is live-only:
//! nothing is replayed to a connection that joins late.

use serde::{Deserialize, Serialize};

use crate::activity::ActivityLogEntry;
use crate::ids::{GroupId, ObserverId, TaskId, UserId};
use crate::task::Task;

/// Error type for channel encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A committed change announced to a group channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardEvent {
    /// A task was created.
    TaskCreated(Task),
    /// A task mutation committed; carries the new record.
    TaskUpdated(Task),
    /// A task was removed.
    TaskDeleted {
        /// The removed task.
        task_id: TaskId,
        /// Group it belonged to.
        group_id: GroupId,
    },
    /// An activity entry was appended.
    ActivityAppended(ActivityLogEntry),
}

impl BoardEvent {
    /// The event's channel name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated(_) => "task.created",
            Self::TaskUpdated(_) => "task.updated",
            Self::TaskDeleted { .. } => "task.deleted",
            Self::ActivityAppended(_) => "activity.appended",
        }
    }

    /// The task this event is about, if any.
    #[must_use]
    pub const fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskCreated(task) | Self::TaskUpdated(task) => Some(&task.id),
            Self::TaskDeleted { task_id, .. } => Some(task_id),
            Self::ActivityAppended(_) => None,
        }
    }

    /// The group whose channel carries this event.
    #[must_use]
    pub const fn group_id(&self) -> &GroupId {
        match self {
            Self::TaskCreated(task) | Self::TaskUpdated(task) => &task.group_id,
            Self::TaskDeleted { group_id, .. } => group_id,
            Self::ActivityAppended(entry) => &entry.group_id,
        }
    }
}

/// Messages exchanged on the live channel, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Client introduces itself. Must be the first frame on a connection.
    Hello {
        /// The connecting user.
        user_id: UserId,
    },

    /// Server accepts the session.
    Welcome {
        /// Identifier the server assigned to this connection.
        observer_id: ObserverId,
    },

    /// Client asks to receive a group's events.
    JoinGroup {
        /// Group to join.
        group_id: GroupId,
    },

    /// Server confirms a join.
    Joined {
        /// Group that was joined.
        group_id: GroupId,
    },

    /// Client stops receiving a group's events.
    LeaveGroup {
        /// Group to leave.
        group_id: GroupId,
    },

    /// Server confirms a leave.
    Left {
        /// Group that was left.
        group_id: GroupId,
    },

    /// A committed change in a joined group.
    Event {
        /// Group channel the event was published on.
        group_id: GroupId,
        /// The change.
        event: BoardEvent,
    },

    /// Server reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Encodes a [`ChannelMessage`] into bytes using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(msg: &ChannelMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ChannelMessage`] from bytes using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<ChannelMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
