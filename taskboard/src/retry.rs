//! Silent convergence for low-stakes edits.
//!
//! [`RetryClient::mutate`] submits a patch against the version the caller
//! last saw. When the server answers with a conflict and attempts remain,
//! the client re-reads the record, adopts its version and resubmits the
//! same patch. Only when every attempt has conflicted does the caller see
//! the conflict, at which point it belongs to the
//! [`ConflictResolver`](crate::resolver::ConflictResolver).
//!
//! The loop is driven by [`RetryMachine`] and can be stopped through a
//! [`CancelHandle`]; a cancelled loop never submits again.

use std::sync::Arc;

use tokio::sync::watch;

use taskboard_proto::api::ConflictError;
use taskboard_proto::ids::TaskId;
use taskboard_proto::task::{Task, TaskPatch};

use crate::api::{ApiError, TaskApi};

/// Default number of submissions, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Where a mutation loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Nothing submitted yet.
    Idle,
    /// Submission number `attempt` (1-based) is in flight.
    Retrying {
        /// Current attempt.
        attempt: u32,
    },
    /// Every attempt conflicted; the conflict is handed to the caller.
    AwaitingResolution,
    /// The server accepted a submission.
    Done,
    /// A non-conflict error or cancellation ended the loop.
    Failed,
}

impl RetryState {
    /// Returns `true` once the loop can make no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::AwaitingResolution | Self::Done | Self::Failed)
    }
}

/// Transition table for one mutation loop.
///
/// Transitions out of a terminal state are ignored.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: RetryState,
    max_attempts: u32,
}

impl RetryMachine {
    /// Creates a machine allowing `max_attempts` submissions (at least one).
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            state: RetryState::Idle,
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RetryState {
        self.state
    }

    /// Idle -> `Retrying { attempt: 1 }`.
    pub fn start(&mut self) -> RetryState {
        if self.state == RetryState::Idle {
            self.state = RetryState::Retrying { attempt: 1 };
        }
        self.state
    }

    /// The in-flight attempt was accepted.
    pub fn succeeded(&mut self) -> RetryState {
        if matches!(self.state, RetryState::Retrying { .. }) {
            self.state = RetryState::Done;
        }
        self.state
    }

    /// The in-flight attempt conflicted. Moves to the next attempt if one
    /// remains, otherwise to [`RetryState::AwaitingResolution`].
    pub fn conflicted(&mut self) -> RetryState {
        if let RetryState::Retrying { attempt } = self.state {
            self.state = if attempt < self.max_attempts {
                RetryState::Retrying {
                    attempt: attempt + 1,
                }
            } else {
                RetryState::AwaitingResolution
            };
        }
        self.state
    }

    /// The loop ended for any other reason.
    pub fn failed(&mut self) -> RetryState {
        if !self.state.is_terminal() {
            self.state = RetryState::Failed;
        }
        self.state
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Creates a linked cancel handle and token.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Stops every loop holding the paired [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_handle, token) = cancel_pair();
        token
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Never resolves if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Why a mutation loop ended without a committed record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutateError {
    /// Every attempt conflicted; carries the latest server record.
    #[error(transparent)]
    Conflict(ConflictError),

    /// The loop was cancelled before a submission was accepted.
    #[error("update cancelled")]
    Cancelled,

    /// Any other failure, surfaced unchanged.
    #[error(transparent)]
    Api(ApiError),
}

/// Resubmits a patch across version conflicts.
#[derive(Debug)]
pub struct RetryClient<A> {
    api: Arc<A>,
    max_attempts: u32,
}

impl<A> Clone for RetryClient<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            max_attempts: self.max_attempts,
        }
    }
}

impl<A: TaskApi> RetryClient<A> {
    /// Creates a client allowing [`DEFAULT_MAX_ATTEMPTS`] submissions.
    #[must_use]
    pub const fn new(api: Arc<A>) -> Self {
        Self {
            api,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the number of submissions.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The underlying API.
    #[must_use]
    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    /// Submits `patch` against `known_version`, retrying on conflict.
    ///
    /// Before every resubmission the record is fetched again and its version
    /// adopted; no version is reused across attempts.
    ///
    /// # Errors
    ///
    /// - [`MutateError::Conflict`] once every attempt has conflicted.
    /// - [`MutateError::Cancelled`] if `cancel` fires before success.
    /// - [`MutateError::Api`] for any other failure, including the record
    ///   vanishing during a refetch.
    pub async fn mutate(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
        known_version: u64,
        cancel: &CancelToken,
    ) -> Result<Task, MutateError> {
        let mut machine = RetryMachine::new(self.max_attempts);
        let mut cancel = cancel.clone();
        let mut version = known_version;
        let mut state = machine.start();

        loop {
            let RetryState::Retrying { attempt } = state else {
                return Err(MutateError::Cancelled);
            };
            if cancel.is_cancelled() {
                machine.failed();
                tracing::info!(task_id = %task_id, attempt, "update cancelled before submit");
                return Err(MutateError::Cancelled);
            }

            match self.api.update(task_id, patch, version).await {
                Ok(task) => {
                    machine.succeeded();
                    tracing::debug!(task_id = %task_id, attempt, version = task.version, "update committed");
                    return Ok(task);
                }
                Err(ApiError::VersionConflict(conflict)) => {
                    state = machine.conflicted();
                    if state == RetryState::AwaitingResolution {
                        tracing::info!(
                            task_id = %task_id,
                            attempts = self.max_attempts,
                            server_version = conflict.server_task.version,
                            "retries exhausted, conflict needs resolution"
                        );
                        return Err(MutateError::Conflict(conflict));
                    }

                    let fetched = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            machine.failed();
                            tracing::info!(task_id = %task_id, attempt, "update cancelled during refetch");
                            return Err(MutateError::Cancelled);
                        }
                        fetched = self.api.fetch(task_id) => fetched,
                    };
                    match fetched {
                        Ok(current) => {
                            tracing::debug!(
                                task_id = %task_id,
                                attempt,
                                stale = version,
                                current = current.version,
                                "conflict, retrying with refreshed version"
                            );
                            version = current.version;
                        }
                        Err(e) => {
                            machine.failed();
                            return Err(MutateError::Api(e));
                        }
                    }
                }
                Err(e) => {
                    machine.failed();
                    tracing::warn!(task_id = %task_id, attempt, err = %e, "update failed");
                    return Err(MutateError::Api(e));
                }
            }
        }
    }
}
