//! Property-based tests for the live channel codec and task patches.
//!
//! Uses proptest to verify:
//! 1. Any event frame survives encode -> decode.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. A validated patch never changes a task's version or identity.

use proptest::prelude::*;
use taskboard_proto::channel::{self, BoardEvent, ChannelMessage};
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{Priority, Task, TaskPatch, TaskStatus};
use uuid::Uuid;

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
    ]
}

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Todo),
        Just(TaskStatus::InProgress),
        Just(TaskStatus::Done),
    ]
}

fn arb_user() -> impl Strategy<Value = UserId> {
    any::<u128>().prop_map(|n| UserId::from_uuid(Uuid::from_u128(n)))
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        any::<u128>(),
        any::<u128>(),
        "[a-zA-Z0-9 ]{1,64}",
        ".{0,128}",
        arb_priority(),
        arb_status(),
        prop::option::of(arb_user()),
        arb_user(),
        1u64..10_000,
        any::<u64>(),
    )
        .prop_map(
            |(id, group, title, description, priority, status, assignee, created_by, version, ts)| {
                Task {
                    id: TaskId::from_uuid(Uuid::from_u128(id)),
                    group_id: GroupId::from_uuid(Uuid::from_u128(group)),
                    title,
                    description,
                    priority,
                    status,
                    assignee,
                    created_by,
                    version,
                    created_at: ts,
                    updated_at: ts,
                }
            },
        )
}

fn arb_patch() -> impl Strategy<Value = TaskPatch> {
    (
        prop::option::of("[a-z]{1,32}"),
        prop::option::of(".{0,64}"),
        prop::option::of(arb_priority()),
        prop::option::of(arb_status()),
        prop::option::of(prop::option::of(arb_user())),
        any::<bool>(),
    )
        .prop_map(
            |(title, description, priority, status, assignee, auto_assign)| TaskPatch {
                title,
                description,
                priority,
                status,
                assignee,
                auto_assign,
            },
        )
}

proptest! {
    #[test]
    fn event_frames_survive_codec(task in arb_task()) {
        let msg = ChannelMessage::Event {
            group_id: task.group_id,
            event: BoardEvent::TaskUpdated(task),
        };
        let bytes = channel::encode(&msg).unwrap();
        prop_assert_eq!(channel::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = channel::decode(&bytes);
    }

    #[test]
    fn patch_never_touches_identity_or_version(task in arb_task(), patch in arb_patch()) {
        let next = patch.apply_to(&task);
        prop_assert_eq!(next.id, task.id);
        prop_assert_eq!(next.group_id, task.group_id);
        prop_assert_eq!(next.version, task.version);
        prop_assert_eq!(next.created_by, task.created_by);
    }
}
