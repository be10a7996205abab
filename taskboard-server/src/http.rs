//! HTTP and live-channel surface: shared state, REST handlers, and the
//! WebSocket session.
//!
//! REST bodies are JSON. The caller's identity arrives in the
//! [`USER_HEADER`] header; every task and activity route checks that the
//! caller belongs to the group involved before touching the coordinator.
//!
//! The `/ws` endpoint carries postcard-encoded [`ChannelMessage`] frames. A
//! session opens with `Hello`, then joins and leaves group channels. Joins
//! are checked against the [`GroupRegistry`] before the observer is added to
//! the [`BroadcastHub`].

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use taskboard_proto::activity::ActivityLogEntry;
use taskboard_proto::api::{
    ActivityQuery, ConflictBody, DeletedBody, ErrorBody, TaskListQuery, USER_HEADER,
    UpdateTaskRequest,
};
use taskboard_proto::channel::{self, ChannelMessage};
use taskboard_proto::group::{CreateGroupRequest, Group, JoinGroupRequest};
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{NewTask, Task};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorError, UpdateCoordinator};
use crate::groups::{GroupRegistry, RegistryError};
use crate::hub::{BroadcastHub, GroupEvent, Observer};
use crate::ledger::ActivityLedger;
use crate::store::{InMemoryTaskStore, TaskStore};

/// Shared server state.
pub struct AppState<S> {
    /// Task mutations, ledger and hub.
    pub coordinator: UpdateCoordinator<S>,
    /// Group directory, shared with the coordinator for auto-assignment.
    pub groups: Arc<GroupRegistry>,
}

impl Default for AppState<InMemoryTaskStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState<InMemoryTaskStore> {
    /// Creates state over an empty in-memory store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryTaskStore::new()), ActivityLedger::new())
    }

    /// Creates state over an empty in-memory store, sized from `config`.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::with_store(
            Arc::new(InMemoryTaskStore::new()),
            ActivityLedger::with_limits(config.ledger_capacity, config.max_detail_len),
        )
    }
}

impl<S: TaskStore> AppState<S> {
    /// Creates state over a caller-supplied store and ledger.
    #[must_use]
    pub fn with_store(store: Arc<S>, ledger: ActivityLedger) -> Self {
        let groups = Arc::new(GroupRegistry::new());
        Self {
            coordinator: UpdateCoordinator::new(
                store,
                Arc::new(BroadcastHub::new()),
                Arc::new(ledger),
                Arc::clone(&groups),
            ),
            groups,
        }
    }

    /// The broadcast hub.
    #[must_use]
    pub fn hub(&self) -> &BroadcastHub {
        self.coordinator.hub()
    }

    /// The activity ledger.
    #[must_use]
    pub fn ledger(&self) -> &ActivityLedger {
        self.coordinator.ledger()
    }

    async fn require_member(&self, group_id: &GroupId, user: &UserId) -> Result<(), ApiError> {
        if self.groups.is_member(group_id, user).await {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by REST handlers, rendered as a status plus JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed caller identity.
    #[error("missing or invalid {USER_HEADER} header")]
    Unauthorized,
    /// The caller is not a member of the group involved.
    #[error("not a member of this group")]
    Forbidden,
    /// The addressed resource does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The request is malformed.
    #[error("{0}")]
    BadRequest(String),
    /// The expected version is stale.
    #[error("version conflict")]
    Conflict(Box<Task>),
    /// The server failed.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Conflict(task) => {
                (status, Json(ConflictBody { server_task: *task })).into_response()
            }
            other => (
                status,
                Json(ErrorBody {
                    error: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::VersionConflict(conflict) => Self::Conflict(conflict.server_task),
            CoordinatorError::NotFound(id) => Self::NotFound(format!("task {id} not found")),
            CoordinatorError::Validation(e) => Self::BadRequest(e.to_string()),
            CoordinatorError::Storage(e) => {
                tracing::error!(error = %e, "storage failure");
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidName => Self::BadRequest(err.to_string()),
            RegistryError::GroupNotFound => Self::NotFound(err.to_string()),
            RegistryError::NotMember => Self::Forbidden,
            RegistryError::CapacityReached => Self::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// The authenticated caller, read from the [`USER_HEADER`] header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

impl<St: Send + Sync> FromRequestParts<St> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(Self)
            .ok_or(ApiError::Unauthorized)
    }
}

type Shared<S> = State<Arc<AppState<S>>>;

// ---------------------------------------------------------------------------
// Task routes
// ---------------------------------------------------------------------------

async fn list_tasks<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    query: Result<Query<TaskListQuery>, QueryRejection>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let Query(query) = query?;
    let group_id = query
        .group_id
        .ok_or_else(|| ApiError::BadRequest("groupId is required".to_string()))?;
    state.require_member(&group_id, &user).await?;
    Ok(Json(state.coordinator.list(&group_id).await?))
}

async fn create_task<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let Json(draft) = body?;
    state.require_member(&draft.group_id, &user).await?;
    let task = state.coordinator.create(user, draft).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    path: Result<Path<TaskId>, PathRejection>,
) -> Result<Json<Task>, ApiError> {
    let Path(task_id) = path?;
    let task = state.coordinator.get(&task_id).await?;
    state.require_member(&task.group_id, &user).await?;
    Ok(Json(task))
}

async fn update_task<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    path: Result<Path<TaskId>, PathRejection>,
    body: Result<Json<UpdateTaskRequest>, JsonRejection>,
) -> Result<Json<Task>, ApiError> {
    let Path(task_id) = path?;
    let Json(request) = body?;
    let current = state.coordinator.get(&task_id).await?;
    state.require_member(&current.group_id, &user).await?;
    let task = state
        .coordinator
        .apply(user, &task_id, &request.patch, request.version)
        .await?;
    Ok(Json(task))
}

async fn delete_task<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    path: Result<Path<TaskId>, PathRejection>,
) -> Result<Json<DeletedBody>, ApiError> {
    let Path(task_id) = path?;
    let current = state.coordinator.get(&task_id).await?;
    state.require_member(&current.group_id, &user).await?;
    let removed = state.coordinator.delete(user, &task_id).await?;
    Ok(Json(DeletedBody { task_id: removed.id }))
}

async fn list_activity<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    query: Result<Query<ActivityQuery>, QueryRejection>,
) -> Result<Json<Vec<ActivityLogEntry>>, ApiError> {
    let Query(query) = query?;
    if let Some(group_id) = &query.group_id {
        state.require_member(group_id, &user).await?;
    }
    let entries = state
        .ledger()
        .recent(query.group_id.as_ref(), query.page, query.page_size)
        .await;
    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// Group routes
// ---------------------------------------------------------------------------

async fn create_group<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let Json(request) = body?;
    let group = state.groups.create(&request.name, user).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn my_groups<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
) -> Json<Vec<Group>> {
    Json(state.groups.groups_for(&user).await)
}

async fn join_group<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    body: Result<Json<JoinGroupRequest>, JsonRejection>,
) -> Result<Json<Group>, ApiError> {
    let Json(request) = body?;
    Ok(Json(state.groups.join_by_token(&request.token, user).await?))
}

async fn leave_group<S: TaskStore>(
    State(state): Shared<S>,
    Caller(user): Caller,
    path: Result<Path<GroupId>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(group_id) = path?;
    state.groups.leave(&group_id, &user).await?;
    let evicted = state.hub().evict_user(&group_id, &user);
    tracing::debug!(group_id = %group_id, user = %user, evicted, "removed departed member's observers");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Live channel
// ---------------------------------------------------------------------------

/// Handles an upgraded WebSocket connection for one client.
///
/// The connection lifecycle:
/// 1. Wait for a `Hello` message and answer with `Welcome`.
/// 2. Process `JoinGroup`/`LeaveGroup`, checking membership on join.
/// 3. Forward hub events for joined groups as `Event` frames.
/// 4. On disconnect, remove the observer from every group.
pub async fn handle_socket<S: TaskStore>(socket: WebSocket, state: Arc<AppState<S>>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user_id) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };

    let (observer, mut events) = Observer::channel(user_id);
    let observer_id = observer.id();
    let welcome = ChannelMessage::Welcome { observer_id };
    if let Err(e) = send_channel_msg(&mut ws_sender, &welcome).await {
        tracing::error!(user = %user_id, error = %e, "failed to send welcome");
        return;
    }
    tracing::info!(user = %user_id, observer_id = %observer_id, "live session opened");

    // Replies are queued before the subscription they confirm, and the
    // writer drains replies first, so `Joined` always precedes that group's
    // first event.
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<ChannelMessage>();
    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                reply = replies.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(GroupEvent { group_id, event }) => {
                        ChannelMessage::Event { group_id, event }
                    }
                    None => break,
                },
            };
            if let Err(e) = send_channel_msg(&mut ws_sender, &msg).await {
                tracing::warn!(observer_id = %observer_id, error = %e, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_control(&data, &observer, &reply_tx, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(observer_id = %observer_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    let groups = state.hub().disconnect(&observer_id);
    tracing::info!(user = %user_id, observer_id = %observer_id, groups, "live session closed");
}

async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match channel::decode(&data) {
                Ok(ChannelMessage::Hello { user_id }) => return Some(user_id),
                Ok(other) => {
                    tracing::warn!(msg = ?other, "expected Hello, got different message");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode hello");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_control<S: TaskStore>(
    data: &[u8],
    observer: &Observer,
    replies: &mpsc::UnboundedSender<ChannelMessage>,
    state: &Arc<AppState<S>>,
) {
    let msg = match channel::decode(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(observer_id = %observer.id(), error = %e, "failed to decode control message");
            let _ = replies.send(ChannelMessage::Error {
                reason: format!("undecodable frame: {e}"),
            });
            return;
        }
    };

    match msg {
        ChannelMessage::JoinGroup { group_id } => {
            if !state.groups.is_member(&group_id, &observer.user()).await {
                tracing::warn!(observer_id = %observer.id(), group_id = %group_id, "join refused, not a member");
                let _ = replies.send(ChannelMessage::Error {
                    reason: format!("not a member of group {group_id}"),
                });
                return;
            }
            let _ = replies.send(ChannelMessage::Joined { group_id });
            state.hub().subscribe(observer, group_id);
            // A leave that landed between the check and the subscribe ran its
            // eviction too early; undo the subscription ourselves.
            if !state.groups.is_member(&group_id, &observer.user()).await {
                state.hub().unsubscribe(&observer.id(), &group_id);
                tracing::info!(observer_id = %observer.id(), group_id = %group_id, "member left during join");
                return;
            }
            tracing::info!(observer_id = %observer.id(), group_id = %group_id, "joined group channel");
        }
        ChannelMessage::LeaveGroup { group_id } => {
            state.hub().unsubscribe(&observer.id(), &group_id);
            let _ = replies.send(ChannelMessage::Left { group_id });
            tracing::info!(observer_id = %observer.id(), group_id = %group_id, "left group channel");
        }
        ChannelMessage::Hello { .. } => {
            tracing::warn!(observer_id = %observer.id(), "duplicate Hello ignored");
        }
        other => {
            tracing::warn!(observer_id = %observer.id(), msg = ?other, "unexpected message type from client");
            let _ = replies.send(ChannelMessage::Error {
                reason: "unexpected message".to_string(),
            });
        }
    }
}

async fn send_channel_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &ChannelMessage,
) -> Result<(), String> {
    let bytes = channel::encode(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

async fn ws_handler<S: TaskStore>(
    ws: WebSocketUpgrade,
    State(state): Shared<S>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Builds the application router over `state`.
pub fn router<S: TaskStore>(state: Arc<AppState<S>>) -> axum::Router {
    axum::Router::new()
        .route("/tasks", get(list_tasks::<S>).post(create_task::<S>))
        .route(
            "/tasks/{id}",
            get(get_task::<S>).put(update_task::<S>).delete(delete_task::<S>),
        )
        .route("/actions", get(list_activity::<S>))
        .route("/groups", post(create_group::<S>))
        .route("/groups/my", get(my_groups::<S>))
        .route("/groups/join", post(join_group::<S>))
        .route("/groups/{id}", axum::routing::delete(leave_group::<S>))
        .route("/ws", get(ws_handler::<S>))
        .with_state(state)
}

/// Starts the server with fresh in-memory state and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(AppState::new())).await
}

/// Starts the server with pre-built state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S: TaskStore>(
    addr: &str,
    state: Arc<AppState<S>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
