//! Integration tests for racing writers on one task.
//!
//! Exercises the server's compare-and-swap through concurrent HTTP clients:
//! exactly one writer wins each version, losers see the winner's record, and
//! retrying writers all land without losing any field.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskboard::api::{ApiError, HttpTaskApi, TaskApi};
use taskboard::retry::{CancelToken, RetryClient};
use taskboard_proto::ids::UserId;
use taskboard_proto::task::{NewTask, Priority, Task, TaskPatch, TaskStatus};
use taskboard_server::http::{self, AppState};

const WRITERS: usize = 3;

/// Starts a server and returns `WRITERS` members of one group plus a task
/// at version 1.
async fn contended_task() -> (Vec<Arc<HttpTaskApi>>, Task) {
    let (addr, _handle) = http::start_server_with_state("127.0.0.1:0", Arc::new(AppState::new()))
        .await
        .unwrap();
    let base = format!("http://{addr}");
    let writers: Vec<Arc<HttpTaskApi>> = (0..WRITERS)
        .map(|_| Arc::new(HttpTaskApi::new(&base, UserId::new(), Duration::from_secs(5)).unwrap()))
        .collect();

    let group = writers[0].create_group("race").await.unwrap();
    for w in &writers[1..] {
        w.join_group(&group.invite_token).await.unwrap();
    }
    let task = writers[0]
        .create(&NewTask {
            group_id: group.id,
            title: "contended".to_string(),
            description: String::new(),
            priority: Priority::Low,
            status: TaskStatus::Todo,
            assignee: None,
        })
        .await
        .unwrap();
    (writers, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_writer_wins_a_version() {
    let (writers, task) = contended_task().await;

    let mut handles = Vec::new();
    for (i, w) in writers.iter().enumerate() {
        let w = Arc::clone(w);
        let id = task.id;
        handles.push(tokio::spawn(async move {
            let patch = TaskPatch {
                title: Some(format!("writer {i}")),
                ..TaskPatch::default()
            };
            w.update(&id, &patch, 1).await
        }));
    }

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(task) => winners.push(task),
            Err(ApiError::VersionConflict(c)) => losers.push(*c.server_task),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), WRITERS - 1);
    let winner = &winners[0];
    assert_eq!(winner.version, 2);
    for loser in &losers {
        assert_eq!(loser, winner);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retrying_writers_all_land() {
    let (writers, task) = contended_task().await;
    let assignees: Vec<UserId> = writers.iter().map(|w| w.user()).collect();

    let mut handles = Vec::new();
    for (i, w) in writers.iter().enumerate() {
        let client = RetryClient::new(Arc::clone(w));
        let id = task.id;
        let patch = match i {
            0 => TaskPatch::status(TaskStatus::InProgress),
            1 => TaskPatch::assignee(Some(assignees[1])),
            _ => TaskPatch {
                priority: Some(Priority::High),
                ..TaskPatch::default()
            },
        };
        handles.push(tokio::spawn(async move {
            client.mutate(&id, &patch, 1, &CancelToken::never()).await
        }));
    }

    let mut versions = HashSet::new();
    for h in handles {
        let committed = h.await.unwrap().unwrap();
        versions.insert(committed.version);
    }
    assert_eq!(versions, HashSet::from([2, 3, 4]));

    let last = writers[0].fetch(&task.id).await.unwrap();
    assert_eq!(last.version, 4);
    assert_eq!(last.status, TaskStatus::InProgress);
    assert_eq!(last.assignee, Some(assignees[1]));
    assert_eq!(last.priority, Priority::High);
}

#[tokio::test]
async fn sequential_updates_count_versions() {
    let (writers, task) = contended_task().await;
    let mut version = task.version;
    for k in 0..10u64 {
        let w = &writers[usize::try_from(k).unwrap() % WRITERS];
        let patch = TaskPatch {
            description: Some(format!("edit {k}")),
            ..TaskPatch::default()
        };
        let next = w.update(&task.id, &patch, version).await.unwrap();
        assert_eq!(next.version, version + 1);
        version = next.version;
    }
    assert_eq!(version, 1 + 10);
}
