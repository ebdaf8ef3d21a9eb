//! tasksync
//!
//! Keeps a live, dependency-aware view of task state for one user: subscribes
//! to project event streams, turns events into notifications, and answers
//! which status transitions a task may undergo right now.

use anyhow::{Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tasksync::api::{HttpTaskApi, TaskApi};
use tasksync::cli::{
    AddDependencyArgs, AnalysisArgs, Cli, Command, FormatArg, MembersArgs, SetStatusArgs,
    TransitionsArgs,
};
use tasksync::config::watcher::start_config_watcher;
use tasksync::config::{Config, ConfigLoader, ConfigPaths};
use tasksync::error::SyncError;
use tasksync::format::{
    OutputFormat, format_analysis, format_members, format_notification, format_transitions,
};
use tasksync::graph::allowed_transitions;
use tasksync::logging::{LogTarget, init_logging};
use tasksync::session::{SessionContext, SyncSession};
use tasksync::source::SseEventSource;
use tasksync::types::{ProjectId, TaskStatus};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Values given on the command line, re-applied after every config reload.
#[derive(Debug, Clone, Default)]
struct CliOverrides {
    api_base: Option<String>,
    token: Option<String>,
    user_id: Option<i64>,
    role: Option<String>,
    project: Option<ProjectId>,
}

impl CliOverrides {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            api_base: cli.api_base.clone(),
            token: cli.token.clone(),
            user_id: cli.user_id,
            role: cli.role.map(|r| r.as_str().to_string()),
            project: cli.project,
        }
    }

    fn apply(&self, config: &mut Config) {
        if let Some(ref base) = self.api_base {
            config.api.base_url = base.clone();
        }
        if let Some(ref token) = self.token {
            config.api.token = Some(token.clone());
        }
        if let Some(user_id) = self.user_id {
            config.session.user_id = Some(user_id);
        }
        if let Some(ref role) = self.role {
            config.session.role = Some(role.clone());
        }
        if let Some(project) = self.project {
            config.session.selected_project = Some(project);
        }
    }
}

fn output_format(arg: FormatArg) -> OutputFormat {
    match arg {
        FormatArg::Markdown => OutputFormat::Markdown,
        FormatArg::Json => OutputFormat::Json,
    }
}

fn require_project(config: &Config) -> Result<ProjectId> {
    match config.session.selected_project {
        Some(project) => Ok(project),
        None => bail!("no project selected: pass --project or set session.selected_project"),
    }
}

fn build_session(config: &Config, api: Arc<HttpTaskApi>) -> Result<SyncSession> {
    let source = Arc::new(SseEventSource::new(
        config.api.base_url.clone(),
        config.api.token.clone(),
    )?);
    Ok(SyncSession::new(
        api,
        source,
        config.session.to_context()?,
        config.session_options(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut loader = match cli.config {
        Some(ref path) => ConfigLoader::load_file(ConfigPaths::discover(), PathBuf::from(path))?,
        None => ConfigLoader::load()?,
    };
    let overrides = CliOverrides::from_cli(&cli);
    overrides.apply(loader.config_mut());
    let config = loader.config().clone();

    let api = Arc::new(HttpTaskApi::new(
        config.api.base_url.clone(),
        config.api.token.clone(),
        config.api.request_timeout(),
    )?);

    match cli.command {
        None | Some(Command::Watch) => run_watch(loader, overrides, api).await,
        Some(Command::Transitions(args)) => run_transitions(&config, api, args).await,
        Some(Command::SetStatus(args)) => run_set_status(&config, api, args).await,
        Some(Command::Analysis(args)) => run_analysis(&config, api, args).await,
        Some(Command::AddDependency(args)) => run_add_dependency(&config, api, args).await,
        Some(Command::Members(args)) => run_members(&config, api, args).await,
    }
}

/// Run a live session until Ctrl-C.
async fn run_watch(loader: ConfigLoader, overrides: CliOverrides, api: Arc<HttpTaskApi>) -> Result<()> {
    let session = Arc::new(build_session(loader.config(), api)?);

    let mut notifications = session.on_notification();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => println!("{}", format_notification(&notification)),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = session.start().await;
    let context = session.context();
    info!(
        user_id = ?context.user_id,
        role = ?context.role,
        scopes = ?report.opened,
        "Session started"
    );
    if context.desired_scopes().is_empty() {
        warn!("No project to watch: select one with --project or use the admin role");
    }

    start_config_reload(&loader, overrides, session.clone());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    session.teardown();
    Ok(())
}

/// Watch the config tiers and re-target the session when they change.
///
/// Runs without hot reload if nothing can be watched.
fn start_config_reload(loader: &ConfigLoader, overrides: CliOverrides, session: Arc<SyncSession>) {
    let dirs = match loader.explicit_path() {
        Some(path) => path.parent().map(|p| vec![p.to_path_buf()]).unwrap_or_default(),
        None => loader.paths.existing_dirs(),
    };
    if dirs.is_empty() {
        info!("No config directory found to watch; hot-reload disabled");
        return;
    }

    let mut handle = match start_config_watcher(dirs, Duration::from_millis(500)) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Failed to start config watcher: {}. Continuing without hot-reload.", e);
            return;
        }
    };

    let loader = loader.clone();
    tokio::spawn(async move {
        while let Some(event) = handle.wait_for_change().await {
            if !event.requires_reload() {
                continue;
            }
            info!("Config change detected: {:?}", event);
            match reload_context(&loader, &overrides, &session.context()) {
                Ok(next) => {
                    session.set_context(next).await;
                }
                Err(e) => warn!("Ignoring config change: {:#}", e),
            }
        }
        info!("Config watcher stopped");
    });
}

fn reload_context(
    loader: &ConfigLoader,
    overrides: &CliOverrides,
    current: &SessionContext,
) -> Result<SessionContext> {
    let mut reloaded = loader.reload()?;
    overrides.apply(reloaded.config_mut());

    let mut next = reloaded.config().session.to_context()?;
    // Identity resolved from the service survives reloads that leave it unset
    next.user_id = next.user_id.or(current.user_id);
    next.role = next.role.or(current.role);
    Ok(next)
}

async fn run_transitions(config: &Config, api: Arc<HttpTaskApi>, args: TransitionsArgs) -> Result<()> {
    let project = require_project(config)?;
    let session = build_session(config, api)?;

    let snapshot = session.refresh_snapshot(project).await?;
    if snapshot.task(args.task_id).is_none() {
        return Err(SyncError::TaskNotFound(args.task_id).into());
    }
    let allowed = allowed_transitions(&snapshot, args.task_id);
    println!(
        "{}",
        format_transitions(&snapshot, args.task_id, &allowed, output_format(args.format))
    );
    Ok(())
}

async fn run_set_status(config: &Config, api: Arc<HttpTaskApi>, args: SetStatusArgs) -> Result<()> {
    let project = require_project(config)?;
    let session = build_session(config, api)?;
    let target = TaskStatus::from(args.status);

    let task = session.change_status(project, args.task_id, target).await?;
    println!("Task #{} \"{}\" is now {}", task.id, task.name, task.status);
    Ok(())
}

async fn run_analysis(config: &Config, api: Arc<HttpTaskApi>, args: AnalysisArgs) -> Result<()> {
    let project = require_project(config)?;
    let analysis = api.get_graph_analysis(project).await?;
    println!("{}", format_analysis(&analysis, output_format(args.format)));
    Ok(())
}

async fn run_add_dependency(
    config: &Config,
    api: Arc<HttpTaskApi>,
    args: AddDependencyArgs,
) -> Result<()> {
    let project = require_project(config)?;
    let session = build_session(config, api)?;

    let dep = session
        .add_dependency(project, args.task_id, args.depends_on)
        .await?;
    println!(
        "Task #{} now waits for #{}",
        dep.task_id, dep.depends_on_task_id
    );
    Ok(())
}

async fn run_members(config: &Config, api: Arc<HttpTaskApi>, args: MembersArgs) -> Result<()> {
    let project = require_project(config)?;
    let members = api.list_project_members(project).await?;
    println!("{}", format_members(&members, output_format(args.format)));
    Ok(())
}
