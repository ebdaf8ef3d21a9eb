//! CLI definitions for `tasksync`.
//!
//! Uses clap's derive macros. Global options override configuration values.

use crate::types::TaskStatus;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FormatArg {
    #[default]
    Markdown,
    Json,
}

/// Role selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Admin,
    Manager,
    Executor,
}

impl RoleArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleArg::Admin => "admin",
            RoleArg::Manager => "manager",
            RoleArg::Executor => "executor",
        }
    }
}

/// Status selector, spelled as the task API spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum StatusArg {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl From<StatusArg> for TaskStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Backlog => TaskStatus::Backlog,
            StatusArg::InProgress => TaskStatus::InProgress,
            StatusArg::Review => TaskStatus::Review,
            StatusArg::Done => TaskStatus::Done,
        }
    }
}

/// Live task-state sync for project/task managers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (bypasses the config tiers)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Base URL of the task service (overrides config)
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Bearer token passed to the task service (overrides config)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Current user id (overrides config)
    #[arg(long, global = true)]
    pub user_id: Option<i64>,

    /// Current role (overrides config)
    #[arg(long, value_enum, global = true)]
    pub role: Option<RoleArg>,

    /// Selected project (overrides config)
    #[arg(short, long, global = true)]
    pub project: Option<i64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Subscribe per role and print notifications until interrupted (default)
    Watch,

    /// Show which status transitions a task may undergo now
    Transitions(TransitionsArgs),

    /// Change a task's status, refused locally if its dependencies forbid it
    SetStatus(SetStatusArgs),

    /// Print the critical-path analysis of a project
    Analysis(AnalysisArgs),

    /// Make a task wait for another, refused locally if it would close a cycle
    AddDependency(AddDependencyArgs),

    /// List the members of a project
    Members(MembersArgs),
}

#[derive(Args, Debug)]
pub struct TransitionsArgs {
    /// Task id
    pub task_id: i64,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Markdown)]
    pub format: FormatArg,
}

#[derive(Args, Debug)]
pub struct SetStatusArgs {
    /// Task id
    pub task_id: i64,

    /// Target status
    #[arg(value_enum)]
    pub status: StatusArg,
}

#[derive(Args, Debug)]
pub struct AddDependencyArgs {
    /// Task that waits
    pub task_id: i64,

    /// Task it waits for
    pub depends_on: i64,
}

#[derive(Args, Debug)]
pub struct MembersArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Markdown)]
    pub format: FormatArg,
}

#[derive(Args, Debug)]
pub struct AnalysisArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Markdown)]
    pub format: FormatArg,
}
