//! Manual resolution of version conflicts.
//!
//! When [`RetryClient`](crate::retry::RetryClient) gives up, the caller holds
//! its local edit and the server's current record. [`diff`] lists the
//! user-facing fields that disagree; a [`Resolution`] picks how to proceed:
//!
//! - [`Resolution::Overwrite`] resubmits every local value as-is.
//! - [`Resolution::Merge`] submits a [`MergeDraft`] seeded from the local
//!   values and edited field by field.
//!
//! Either way the submission targets the server's version, so it can
//! conflict again; [`ConflictResolver::resolve_with`] keeps presenting fresh
//! conflicts until one submission lands or the decision callback gives up.

use std::fmt;
use std::sync::Arc;

use taskboard_proto::api::ConflictError;
use taskboard_proto::ids::UserId;
use taskboard_proto::task::{Priority, Task, TaskPatch};

use crate::api::{ApiError, TaskApi};

/// A field compared during conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Task title.
    Title,
    /// Task description.
    Description,
    /// Task priority.
    Priority,
    /// Assigned user.
    Assignee,
}

impl Field {
    /// All compared fields, in display order.
    pub const ALL: [Self; 4] = [Self::Title, Self::Description, Self::Priority, Self::Assignee];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Priority => "priority",
            Self::Assignee => "assignee",
        })
    }
}

/// One field whose local and server values differ, rendered for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    /// The differing field.
    pub field: Field,
    /// Local value.
    pub local: String,
    /// Server value.
    pub server: String,
}

/// Reports every compared field where `local` and `server` disagree.
#[must_use]
pub fn diff(local: &Task, server: &Task) -> Vec<FieldDiff> {
    Field::ALL
        .into_iter()
        .filter_map(|field| {
            let (l, s) = (render(field, local), render(field, server));
            (l != s).then_some(FieldDiff {
                field,
                local: l,
                server: s,
            })
        })
        .collect()
}

fn render(field: Field, task: &Task) -> String {
    match field {
        Field::Title => task.title.clone(),
        Field::Description => task.description.clone(),
        Field::Priority => task.priority.to_string(),
        Field::Assignee => task
            .assignee
            .map_or_else(|| "unassigned".to_string(), |u| u.to_string()),
    }
}

/// Field-by-field resolved values for a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDraft {
    /// Resolved title.
    pub title: String,
    /// Resolved description.
    pub description: String,
    /// Resolved priority.
    pub priority: Priority,
    /// Resolved assignee.
    pub assignee: Option<UserId>,
}

impl MergeDraft {
    /// Seeds a draft with the local values.
    #[must_use]
    pub fn from_local(local: &Task) -> Self {
        Self {
            title: local.title.clone(),
            description: local.description.clone(),
            priority: local.priority,
            assignee: local.assignee,
        }
    }

    /// Replaces one field with the server's value.
    #[must_use]
    pub fn take_server(mut self, field: Field, server: &Task) -> Self {
        match field {
            Field::Title => self.title.clone_from(&server.title),
            Field::Description => self.description.clone_from(&server.description),
            Field::Priority => self.priority = server.priority,
            Field::Assignee => self.assignee = server.assignee,
        }
        self
    }

    /// The patch submitting this draft. Status is left untouched.
    #[must_use]
    pub fn into_patch(self) -> TaskPatch {
        TaskPatch {
            title: Some(self.title),
            description: Some(self.description),
            priority: Some(self.priority),
            status: None,
            assignee: Some(self.assignee),
            auto_assign: false,
        }
    }
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Resubmit the local values verbatim.
    Overwrite,
    /// Submit a hand-resolved draft.
    Merge(MergeDraft),
}

impl Resolution {
    fn patch_for(&self, local: &Task) -> TaskPatch {
        match self {
            Self::Overwrite => TaskPatch::from_task(local),
            Self::Merge(draft) => draft.clone().into_patch(),
        }
    }
}

/// Why [`ConflictResolver::resolve_with`] stopped without a commit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The decision callback declined to resolve; carries the latest server
    /// record it was shown.
    #[error("resolution abandoned at server version {}", .server_task.version)]
    Abandoned {
        /// Latest server record.
        server_task: Box<Task>,
    },

    /// A submission failed for a reason other than a conflict.
    #[error(transparent)]
    Api(ApiError),
}

/// Resubmits resolved edits against the server's current version.
#[derive(Debug)]
pub struct ConflictResolver<A> {
    api: Arc<A>,
}

impl<A: TaskApi> ConflictResolver<A> {
    /// Creates a resolver over `api`.
    #[must_use]
    pub const fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    /// Submits one resolution of `conflict`, targeting the server version.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::VersionConflict`] if the record moved again, or
    /// any other [`ApiError`] from the submission.
    pub async fn resolve(
        &self,
        local: &Task,
        conflict: &ConflictError,
        resolution: &Resolution,
    ) -> Result<Task, ApiError> {
        let server = &conflict.server_task;
        let patch = resolution.patch_for(local);
        tracing::info!(
            task_id = %local.id,
            server_version = server.version,
            overwrite = matches!(resolution, Resolution::Overwrite),
            "submitting conflict resolution"
        );
        self.api.update(&local.id, &patch, server.version).await
    }

    /// Resolves `conflict`, asking `decide` for a [`Resolution`] each time
    /// the server reports a conflict, until a submission is accepted.
    ///
    /// `decide` receives the local task, the current server task and their
    /// differing fields; returning `None` abandons the resolution.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Abandoned`] or [`ResolveError::Api`].
    pub async fn resolve_with<F>(
        &self,
        local: &Task,
        mut conflict: ConflictError,
        mut decide: F,
    ) -> Result<Task, ResolveError>
    where
        F: FnMut(&Task, &Task, &[FieldDiff]) -> Option<Resolution>,
    {
        loop {
            let diffs = diff(local, &conflict.server_task);
            let Some(resolution) = decide(local, &conflict.server_task, &diffs) else {
                tracing::info!(task_id = %local.id, "conflict resolution abandoned");
                return Err(ResolveError::Abandoned {
                    server_task: conflict.server_task,
                });
            };

            match self.resolve(local, &conflict, &resolution).await {
                Ok(task) => return Ok(task),
                Err(ApiError::VersionConflict(fresh)) => {
                    tracing::info!(
                        task_id = %local.id,
                        server_version = fresh.server_task.version,
                        "record moved again during resolution"
                    );
                    conflict = fresh;
                }
                Err(e) => return Err(ResolveError::Api(e)),
            }
        }
    }
}
