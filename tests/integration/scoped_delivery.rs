//! Integration tests for group-scoped live delivery.
//!
//! Each user connects a [`BoardFeed`] to the real server's `/ws` endpoint
//! and joins group channels. Events must reach exactly the observers of the
//! group they belong to.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use taskboard::api::{HttpTaskApi, TaskApi};
use taskboard::board::LocalBoard;
use taskboard::feed::{self, BoardFeed, FeedError};
use taskboard_proto::channel::BoardEvent;
use taskboard_proto::group::Group;
use taskboard_proto::ids::{GroupId, UserId};
use taskboard_proto::task::{NewTask, Priority, Task, TaskPatch, TaskStatus};
use taskboard_server::http::{self, AppState};

const QUIET: Duration = Duration::from_millis(300);

struct Server {
    base: String,
}

impl Server {
    async fn start() -> Self {
        let (addr, _handle) =
            http::start_server_with_state("127.0.0.1:0", Arc::new(AppState::new()))
                .await
                .unwrap();
        Self {
            base: format!("http://{addr}"),
        }
    }

    fn user(&self) -> HttpTaskApi {
        HttpTaskApi::new(&self.base, UserId::new(), Duration::from_secs(5)).unwrap()
    }

    async fn feed(&self, api: &HttpTaskApi) -> BoardFeed {
        let url = feed::feed_url(&self.base).unwrap();
        BoardFeed::connect(&url, api.user()).await.unwrap()
    }
}

async fn create(api: &HttpTaskApi, group: &Group, title: &str) -> Task {
    api.create(&NewTask {
        group_id: group.id,
        title: title.to_string(),
        description: String::new(),
        priority: Priority::Medium,
        status: TaskStatus::Todo,
        assignee: None,
    })
    .await
    .unwrap()
}

/// Collects events until the feed stays quiet for [`QUIET`].
async fn drain(feed: &BoardFeed) -> Vec<(GroupId, BoardEvent)> {
    let mut events = Vec::new();
    while let Some(event) = feed.next_event_within(QUIET).await.unwrap() {
        events.push(event);
    }
    events
}

fn names(events: &[(GroupId, BoardEvent)]) -> Vec<&'static str> {
    events.iter().map(|(_, e)| e.name()).collect()
}

#[tokio::test]
async fn update_reaches_only_its_group() {
    let server = Server::start().await;
    let alice = server.user();
    let bob = server.user();
    let g1 = alice.create_group("G1").await.unwrap();
    let g2 = bob.create_group("G2").await.unwrap();
    let task = create(&alice, &g1, "scoped").await;

    let o1 = server.feed(&alice).await;
    let o2 = server.feed(&bob).await;
    o1.join(g1.id).await.unwrap();
    o2.join(g2.id).await.unwrap();

    alice
        .update(&task.id, &TaskPatch::status(TaskStatus::Done), 1)
        .await
        .unwrap();

    let seen = drain(&o1).await;
    assert_eq!(names(&seen), vec!["activity.appended", "task.updated"]);
    assert!(seen.iter().all(|(g, _)| *g == g1.id));
    let BoardEvent::TaskUpdated(updated) = &seen[1].1 else {
        panic!("expected task.updated");
    };
    assert_eq!(updated.version, 2);

    assert!(o2.next_event_within(QUIET).await.unwrap().is_none());
}

#[tokio::test]
async fn observer_in_two_groups_sees_both() {
    let server = Server::start().await;
    let alice = server.user();
    let g1 = alice.create_group("G1").await.unwrap();
    let g2 = alice.create_group("G2").await.unwrap();

    let feed = server.feed(&alice).await;
    feed.join(g1.id).await.unwrap();
    feed.join(g2.id).await.unwrap();

    create(&alice, &g1, "one").await;
    create(&alice, &g2, "two").await;

    let groups: Vec<GroupId> = drain(&feed)
        .await
        .into_iter()
        .filter(|(_, e)| e.name() == "task.created")
        .map(|(g, _)| g)
        .collect();
    assert_eq!(groups, vec![g1.id, g2.id]);
}

#[tokio::test]
async fn non_member_join_is_rejected() {
    let server = Server::start().await;
    let alice = server.user();
    let mallory = server.user();
    let group = alice.create_group("private").await.unwrap();

    let feed = server.feed(&mallory).await;
    let err = feed.join(group.id).await.unwrap_err();
    assert!(matches!(err, FeedError::Rejected(_)));

    create(&alice, &group, "secret").await;
    assert!(feed.next_event_within(QUIET).await.unwrap().is_none());
}

#[tokio::test]
async fn leaving_stops_delivery_without_replay() {
    let server = Server::start().await;
    let alice = server.user();
    let group = alice.create_group("G").await.unwrap();

    let feed = server.feed(&alice).await;
    feed.join(group.id).await.unwrap();
    feed.leave(group.id).await.unwrap();

    create(&alice, &group, "while away").await;
    assert!(feed.next_event_within(QUIET).await.unwrap().is_none());

    feed.join(group.id).await.unwrap();
    assert!(feed.next_event_within(QUIET).await.unwrap().is_none());

    create(&alice, &group, "after rejoin").await;
    assert_eq!(names(&drain(&feed).await), vec!["activity.appended", "task.created"]);
}

#[tokio::test]
async fn leaving_the_group_evicts_the_observer() {
    let server = Server::start().await;
    let alice = server.user();
    let bob = server.user();
    let group = alice.create_group("G").await.unwrap();
    bob.join_group(&group.invite_token).await.unwrap();

    let bobs_feed = server.feed(&bob).await;
    bobs_feed.join(group.id).await.unwrap();
    bob.leave_group(&group.id).await.unwrap();

    create(&alice, &group, "after bob left").await;
    assert!(bobs_feed.next_event_within(QUIET).await.unwrap().is_none());
}

#[tokio::test]
async fn replica_follows_successive_updates() {
    let server = Server::start().await;
    let alice = server.user();
    let group = alice.create_group("G").await.unwrap();
    let task = create(&alice, &group, "contended").await;

    let feed = server.feed(&alice).await;
    feed.join(group.id).await.unwrap();
    let mut board = LocalBoard::new(group.id);
    board.load(alice.list(&group.id).await.unwrap());

    let mut version = task.version;
    for status in [TaskStatus::InProgress, TaskStatus::Done, TaskStatus::Todo] {
        version = alice
            .update(&task.id, &TaskPatch::status(status), version)
            .await
            .unwrap()
            .version;
    }

    let mut seen_versions = Vec::new();
    for (_, event) in drain(&feed).await {
        if let BoardEvent::TaskUpdated(t) = &event {
            seen_versions.push(t.version);
        }
        board.apply(&event);
    }
    assert_eq!(seen_versions, vec![2, 3, 4]);
    assert_eq!(board.get(&task.id), Some(&alice.fetch(&task.id).await.unwrap()));
    assert_eq!(board.activity().count(), 3);
}

#[tokio::test]
async fn deletion_reaches_observers() {
    let server = Server::start().await;
    let alice = server.user();
    let group = alice.create_group("G").await.unwrap();
    let task = create(&alice, &group, "doomed").await;

    let feed = server.feed(&alice).await;
    feed.join(group.id).await.unwrap();
    alice.delete(&task.id).await.unwrap();

    let seen = drain(&feed).await;
    assert!(seen.iter().any(|(_, e)| matches!(
        e,
        BoardEvent::TaskDeleted { task_id, .. } if *task_id == task.id
    )));
}

#[tokio::test]
async fn unread_backlog_does_not_block_joining_another_group() {
    let server = Server::start().await;
    let alice = server.user();
    let busy = alice.create_group("busy").await.unwrap();
    let other = alice.create_group("other").await.unwrap();

    let feed = server.feed(&alice).await;
    feed.join(busy.id).await.unwrap();
    // Two events per create, so the backlog is twice the queue.
    for i in 0..feed::EVENT_QUEUE {
        create(&alice, &busy, &format!("backlog {i}")).await;
    }

    feed.join(other.id).await.unwrap();

    let backlog = drain(&feed).await;
    let dropped = usize::try_from(feed.dropped_events()).unwrap();
    assert!(dropped > 0);
    assert_eq!(backlog.len() + dropped, 2 * feed::EVENT_QUEUE);

    create(&alice, &other, "after the backlog").await;
    let fresh = drain(&feed).await;
    assert_eq!(names(&fresh), vec!["activity.appended", "task.created"]);
    assert!(fresh.iter().all(|(g, _)| *g == other.id));
}
