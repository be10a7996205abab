//! Taskboard command-line client.
//!
//! # Usage
//!
//! ```bash
//! export TASKBOARD_USER=<your user id>
//! taskboard group create "Platform"
//! taskboard create <group-id> --title "Fix login" --priority high
//! taskboard update <task-id> --status done
//! taskboard update <task-id> --auto-assign
//! taskboard update <task-id> --title "Fix logout" --on-conflict overwrite
//! taskboard watch <group-id>
//! taskboard activity --group <group-id>
//! ```
//!
//! Logs go to a file (default: temp dir `taskboard.log`) so stdout only
//! carries command output.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskboard::api::{ApiError, HttpTaskApi, TaskApi};
use taskboard::board::{Applied, LocalBoard};
use taskboard::config::{CliArgs, ClientConfig, ConfigError};
use taskboard::feed::{self, BoardFeed, FeedError};
use taskboard::resolver::{self, ConflictResolver, ResolveError, Resolution};
use taskboard::retry::{CancelToken, MutateError, RetryClient};
use taskboard_proto::activity::ActivityLogEntry;
use taskboard_proto::api::{ActivityQuery, ConflictError, DEFAULT_PAGE_SIZE};
use taskboard_proto::channel::BoardEvent;
use taskboard_proto::group::Group;
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{NewTask, Priority, Task, TaskPatch, TaskStatus};

#[derive(clap::Parser, Debug)]
#[command(version, about = "Collaborative task board client")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Show one task.
    Show {
        /// Task id.
        task: TaskId,
    },
    /// List a group's board by column.
    List {
        /// Group id.
        group: GroupId,
    },
    /// Create a task.
    Create {
        /// Group id.
        group: GroupId,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long, default_value = "todo")]
        status: TaskStatus,
        #[arg(long)]
        assign: Option<UserId>,
    },
    /// Update a task, retrying on conflicting edits.
    Update(UpdateArgs),
    /// Delete a task.
    Delete {
        /// Task id.
        task: TaskId,
    },
    /// Follow a group's board live.
    Watch {
        /// Group id.
        group: GroupId,
    },
    /// Show recent activity, newest first.
    Activity {
        /// Restrict to one group.
        #[arg(long)]
        group: Option<GroupId>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Manage group membership.
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },
}

#[derive(clap::Args, Debug)]
struct UpdateArgs {
    /// Task id.
    task: TaskId,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    priority: Option<Priority>,
    #[arg(long)]
    status: Option<TaskStatus>,
    #[arg(long, conflicts_with_all = ["unassign", "auto_assign"])]
    assign: Option<UserId>,
    #[arg(long, conflicts_with = "auto_assign")]
    unassign: bool,
    /// Hand the task to the group member with the fewest open tasks.
    #[arg(long)]
    auto_assign: bool,
    /// What to do when retries cannot get past a conflicting edit.
    #[arg(long, value_enum, default_value_t = OnConflict::Abort)]
    on_conflict: OnConflict,
}

impl UpdateArgs {
    fn patch(&self) -> TaskPatch {
        TaskPatch {
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority,
            status: self.status,
            assignee: if self.unassign {
                Some(None)
            } else {
                self.assign.map(Some)
            },
            auto_assign: self.auto_assign,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OnConflict {
    /// Print the differing fields and stop.
    Abort,
    /// Resubmit the local values over the server's.
    Overwrite,
}

#[derive(clap::Subcommand, Debug)]
enum GroupCommand {
    /// Create a group you own.
    Create { name: String },
    /// Join a group by invite token.
    Join { token: String },
    /// List your groups.
    Mine,
    /// Leave a group.
    Leave { group: GroupId },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no user id configured (use --user or TASKBOARD_USER)")]
    MissingUser,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("update cancelled")]
    Cancelled,
    #[error("{0}; rerun with --on-conflict overwrite to keep your values")]
    Unresolved(ConflictError),
}

impl CliError {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::Unresolved(_) | Self::Resolve(ResolveError::Abandoned { .. }) => 2,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ClientConfig::load(&cli.args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.args.log_level, cli.args.log_file.as_deref());
    tracing::info!(server = %config.server_url, "taskboard starting");

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::warn!(err = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initialize file-based tracing.
///
/// Returns a guard that must be held for the program's lifetime to ensure
/// logs are flushed. Returns `None` if the log path has no usable parent
/// directory or file name.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("taskboard.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let user = config.user_id.ok_or(CliError::MissingUser)?;
    let api = Arc::new(HttpTaskApi::new(&config.server_url, user, config.request_timeout)?);

    match command {
        Command::Show { task } => print_task(&api.fetch(&task).await?),
        Command::List { group } => {
            let mut board = LocalBoard::new(group);
            board.load(api.list(&group).await?);
            print_board(&board);
        }
        Command::Create {
            group,
            title,
            description,
            priority,
            status,
            assign,
        } => {
            let draft = NewTask {
                group_id: group,
                title,
                description,
                priority,
                status,
                assignee: assign,
            };
            print_task(&api.create(&draft).await?);
        }
        Command::Update(args) => update(&api, &args, config.max_attempts).await?,
        Command::Delete { task } => {
            let removed = api.delete(&task).await?;
            println!("deleted {removed}");
        }
        Command::Watch { group } => watch(&api, group, config).await?,
        Command::Activity {
            group,
            page,
            page_size,
        } => {
            let query = ActivityQuery {
                group_id: group,
                page,
                page_size,
            };
            for entry in api.activity(&query).await? {
                print_activity(&entry);
            }
        }
        Command::Group { action } => match action {
            GroupCommand::Create { name } => print_group(&api.create_group(&name).await?),
            GroupCommand::Join { token } => print_group(&api.join_group(&token).await?),
            GroupCommand::Mine => {
                for group in api.my_groups().await? {
                    print_group(&group);
                }
            }
            GroupCommand::Leave { group } => {
                api.leave_group(&group).await?;
                println!("left {group}");
            }
        },
    }
    Ok(())
}

async fn update(
    api: &Arc<HttpTaskApi>,
    args: &UpdateArgs,
    max_attempts: u32,
) -> Result<(), CliError> {
    let patch = args.patch();
    let base = api.fetch(&args.task).await?;
    let local = patch.apply_to(&base);

    let client = RetryClient::new(Arc::clone(api)).with_max_attempts(max_attempts);
    let conflict = match client
        .mutate(&args.task, &patch, base.version, &CancelToken::never())
        .await
    {
        Ok(task) => {
            print_task(&task);
            return Ok(());
        }
        Err(MutateError::Conflict(conflict)) => conflict,
        Err(MutateError::Cancelled) => return Err(CliError::Cancelled),
        Err(MutateError::Api(e)) => return Err(e.into()),
    };

    for d in resolver::diff(&local, &conflict.server_task) {
        println!("{:<12} yours: {:<30} theirs: {}", d.field, d.local, d.server);
    }
    if args.on_conflict == OnConflict::Abort {
        return Err(CliError::Unresolved(conflict));
    }

    let resolver = ConflictResolver::new(Arc::clone(api));
    let mut rounds = 0;
    let task = resolver
        .resolve_with(&local, conflict, |_, server, _| {
            rounds += 1;
            tracing::info!(round = rounds, server_version = server.version, "overwriting");
            (rounds <= max_attempts).then_some(Resolution::Overwrite)
        })
        .await?;
    print_task(&task);
    Ok(())
}

async fn watch(api: &HttpTaskApi, group: GroupId, config: &ClientConfig) -> Result<(), CliError> {
    let url = feed::feed_url(&config.server_url)?;
    let feed = BoardFeed::connect_with_timeouts(
        &url,
        api.user(),
        config.connect_timeout,
        config.reply_timeout,
    )
    .await?;
    feed.join(group).await?;

    // Seed after joining so no commit falls between the listing and the feed.
    let mut board = seed_board(api, group).await?;
    let mut dropped = feed.dropped_events();
    print_board(&board);

    loop {
        let (_, event) = match feed.next_event().await {
            Ok(next) => next,
            Err(FeedError::ConnectionClosed) => {
                println!("connection closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if feed.dropped_events() != dropped {
            dropped = feed.dropped_events();
            tracing::warn!(dropped, "live events were dropped, reloading board");
            board = seed_board(api, group).await?;
            board.apply(&event);
            println!("-- reloaded");
            print_board(&board);
            continue;
        }

        match (board.apply(&event), &event) {
            (Applied::Ignored, _) => {}
            (Applied::Activity, BoardEvent::ActivityAppended(entry)) => print_activity(entry),
            (applied, _) => {
                println!("-- {} ({applied:?})", event.name());
                print_board(&board);
            }
        }
    }
}

async fn seed_board(api: &HttpTaskApi, group: GroupId) -> Result<LocalBoard, CliError> {
    let mut board = LocalBoard::new(group);
    board.load(api.list(&group).await?);
    let query = ActivityQuery {
        group_id: Some(group),
        ..ActivityQuery::default()
    };
    board.load_activity(api.activity(&query).await?);
    Ok(board)
}

fn print_task(task: &Task) {
    println!("{} [{}] v{}", task.title, task.status, task.version);
    println!("  id:       {}", task.id);
    println!("  group:    {}", task.group_id);
    println!("  priority: {}", task.priority);
    println!(
        "  assignee: {}",
        task.assignee.map_or_else(|| "unassigned".to_string(), |u| u.to_string())
    );
    if !task.description.is_empty() {
        println!("  {}", task.description);
    }
}

fn print_board(board: &LocalBoard) {
    for status in [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Done] {
        let column = board.column(status);
        println!("{status} ({})", column.len());
        for task in column {
            println!("  {} {:<40} {:<6} v{}", task.id, task.title, task.priority, task.version);
        }
    }
}

fn print_activity(entry: &ActivityLogEntry) {
    let when = i64::try_from(entry.timestamp)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| entry.timestamp.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
    println!("{when}  {:<14} {}  {}", entry.action.tag(), entry.actor, entry.detail);
}

fn print_group(group: &Group) {
    println!("{} {} ({} members)", group.id, group.name, group.members.len());
    println!("  invite: {}", group.invite_token);
}
