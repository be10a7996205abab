//! Integration tests for the bounded activity ledger as seen through
//! `GET /actions`.
//!
//! The ledger keeps one system-wide window of the most recent entries, so a
//! busy group can push another group's history out of view.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use taskboard::api::{ApiError, HttpTaskApi, TaskApi};
use taskboard_proto::activity::ActivityAction;
use taskboard_proto::api::ActivityQuery;
use taskboard_proto::group::Group;
use taskboard_proto::ids::UserId;
use taskboard_proto::task::{NewTask, Priority, TaskPatch, TaskStatus};
use taskboard_server::http::{self, AppState};

async fn start() -> Arc<HttpTaskApi> {
    let (addr, _handle) = http::start_server_with_state("127.0.0.1:0", Arc::new(AppState::new()))
        .await
        .unwrap();
    Arc::new(
        HttpTaskApi::new(&format!("http://{addr}"), UserId::new(), Duration::from_secs(5)).unwrap(),
    )
}

async fn create(api: &HttpTaskApi, group: &Group, title: &str) {
    api.create(&NewTask {
        group_id: group.id,
        title: title.to_string(),
        description: String::new(),
        priority: Priority::Low,
        status: TaskStatus::Todo,
        assignee: None,
    })
    .await
    .unwrap();
}

fn page(group: Option<&Group>, page: usize, page_size: usize) -> ActivityQuery {
    ActivityQuery {
        group_id: group.map(|g| g.id),
        page,
        page_size,
    }
}

#[tokio::test]
async fn twenty_five_appends_keep_the_newest_twenty() {
    let api = start().await;
    let groups = [
        api.create_group("alpha").await.unwrap(),
        api.create_group("beta").await.unwrap(),
        api.create_group("gamma").await.unwrap(),
    ];

    for i in 1..=25 {
        create(&api, &groups[i % groups.len()], &format!("task {i}")).await;
    }

    let entries = api.activity(&page(None, 1, 20)).await.unwrap();
    let details: Vec<String> = entries.iter().map(|e| e.detail.clone()).collect();
    let expected: Vec<String> = (6..=25).rev().map(|i| format!("Created \"task {i}\"")).collect();
    assert_eq!(details, expected);
    assert!(entries.iter().all(|e| e.action == ActivityAction::TaskCreated));
}

#[tokio::test]
async fn group_view_filters_the_global_window() {
    let api = start().await;
    let quiet = api.create_group("quiet").await.unwrap();
    let busy = api.create_group("busy").await.unwrap();

    create(&api, &quiet, "early").await;
    for i in 0..20 {
        create(&api, &busy, &format!("busy {i}")).await;
    }

    let quiet_view = api.activity(&page(Some(&quiet), 1, 20)).await.unwrap();
    assert!(quiet_view.is_empty());

    let busy_view = api.activity(&page(Some(&busy), 1, 20)).await.unwrap();
    assert_eq!(busy_view.len(), 20);
    assert!(busy_view.iter().all(|e| e.group_id == busy.id));
}

#[tokio::test]
async fn pages_walk_backwards_in_time() {
    let api = start().await;
    let group = api.create_group("paged").await.unwrap();
    for i in 1..=12 {
        create(&api, &group, &format!("t{i}")).await;
    }

    let first = api.activity(&page(Some(&group), 1, 5)).await.unwrap();
    let second = api.activity(&page(Some(&group), 2, 5)).await.unwrap();
    let third = api.activity(&page(Some(&group), 3, 5)).await.unwrap();
    assert_eq!(first[0].detail, "Created \"t12\"");
    assert_eq!(second[0].detail, "Created \"t7\"");
    assert_eq!(third.len(), 2);
    assert_eq!(third[1].detail, "Created \"t1\"");
}

#[tokio::test]
async fn every_mutation_kind_is_recorded() {
    let api = start().await;
    let group = api.create_group("kinds").await.unwrap();
    create(&api, &group, "lifecycle").await;
    let task = api.list(&group.id).await.unwrap().remove(0);

    let moved = api
        .update(&task.id, &TaskPatch::status(TaskStatus::InProgress), 1)
        .await
        .unwrap();
    let assigned = api
        .update(&task.id, &TaskPatch::assignee(Some(api.user())), moved.version)
        .await
        .unwrap();
    api.update(
        &task.id,
        &TaskPatch {
            title: Some("lifecycle v2".to_string()),
            ..TaskPatch::default()
        },
        assigned.version,
    )
    .await
    .unwrap();
    api.delete(&task.id).await.unwrap();

    let actions: Vec<ActivityAction> = api
        .activity(&page(Some(&group), 1, 20))
        .await
        .unwrap()
        .iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            ActivityAction::TaskDeleted,
            ActivityAction::TaskUpdated,
            ActivityAction::TaskAssigned,
            ActivityAction::TaskMoved,
            ActivityAction::TaskCreated,
        ]
    );
}

#[tokio::test]
async fn a_conflicting_update_records_nothing() {
    let api = start().await;
    let group = api.create_group("quiet conflict").await.unwrap();
    create(&api, &group, "once").await;
    let task = api.list(&group.id).await.unwrap().remove(0);
    api.update(&task.id, &TaskPatch::status(TaskStatus::Done), 1)
        .await
        .unwrap();

    let err = api
        .update(&task.id, &TaskPatch::status(TaskStatus::Todo), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::VersionConflict(_)));
    assert_eq!(api.activity(&page(Some(&group), 1, 20)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn group_activity_requires_membership() {
    let api = start().await;
    let group = api.create_group("private").await.unwrap();
    let outsider =
        HttpTaskApi::new(api.base_url(), UserId::new(), Duration::from_secs(5)).unwrap();
    let err = outsider.activity(&page(Some(&group), 1, 20)).await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized(_)));
}
