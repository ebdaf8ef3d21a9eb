//! Output formatting for the CLI, as markdown or JSON.

use crate::graph::{AllowedTransitions, GraphSnapshot, blockers};
use crate::notifications::Notification;
use crate::types::{GraphAnalysis, ProjectMember, TaskId};
use chrono::{Local, TimeZone};
use serde_json::{Value, json};

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Json,
    #[default]
    Markdown,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "markdown" | "md" => Some(OutputFormat::Markdown),
            _ => None,
        }
    }
}

/// Render the allowed transitions of one task.
pub fn format_transitions(
    snapshot: &GraphSnapshot,
    task_id: TaskId,
    allowed: &AllowedTransitions,
    format: OutputFormat,
) -> String {
    let blocked_by = blockers(snapshot, task_id);
    // Edges to tasks outside the snapshot never block
    let mut unknown: Vec<TaskId> = snapshot
        .dangling_edges()
        .iter()
        .filter(|e| e.task_id == task_id)
        .map(|e| e.depends_on_task_id)
        .collect();
    unknown.sort_unstable();
    let task = snapshot.task(task_id);

    match format {
        OutputFormat::Json => {
            let value = json!({
                "task_id": task_id,
                "project_id": snapshot.project_id,
                "status": task.map(|t| t.status),
                "can_start": allowed.can_start,
                "can_complete": allowed.can_complete,
                "can_reset": allowed.can_reset,
                "blocked_by": blocked_by,
                "unknown_predecessors": unknown,
            });
            to_pretty(&value)
        }
        OutputFormat::Markdown => {
            let mut md = String::new();
            match task {
                Some(task) => md.push_str(&format!("## Task #{}: {}\n", task.id, task.name)),
                None => md.push_str(&format!("## Task #{}\n", task_id)),
            }
            if let Some(task) = task {
                md.push_str(&format!("- **status**: {}\n", task.status));
            }
            md.push_str(&format!("- **can_start**: {}\n", yes_no(allowed.can_start)));
            md.push_str(&format!(
                "- **can_complete**: {}\n",
                yes_no(allowed.can_complete)
            ));
            md.push_str(&format!("- **can_reset**: {}\n", yes_no(allowed.can_reset)));
            if !blocked_by.is_empty() {
                let ids: Vec<String> = blocked_by.iter().map(|id| format!("#{id}")).collect();
                md.push_str(&format!("- **blocked_by**: {}\n", ids.join(", ")));
            }
            if !unknown.is_empty() {
                let ids: Vec<String> = unknown.iter().map(|id| format!("#{id}")).collect();
                md.push_str(&format!("- **unknown_predecessors**: {}\n", ids.join(", ")));
            }
            md
        }
    }
}

/// Render the critical-path analysis as received from the service.
pub fn format_analysis(analysis: &GraphAnalysis, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_pretty(&json!(analysis)),
        OutputFormat::Markdown => {
            let mut md = String::new();
            md.push_str(&format!(
                "# Project #{} schedule ({} days)\n\n",
                analysis.project_id, analysis.duration
            ));

            let path: Vec<String> = analysis
                .critical_path
                .iter()
                .map(|id| format!("#{id}"))
                .collect();
            md.push_str(&format!("**Critical path**: {}\n\n", path.join(" -> ")));

            md.push_str("| id | name | es | ef | ls | lf | slack | critical |\n");
            md.push_str("|---|---|---|---|---|---|---|---|\n");
            for node in &analysis.nodes {
                md.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
                    node.id,
                    node.name,
                    node.es,
                    node.ef,
                    node.ls,
                    node.lf,
                    node.slack,
                    if node.is_critical { "yes" } else { "" }
                ));
            }

            let redundant = analysis.edges.iter().filter(|e| e.redundant).count();
            if redundant > 0 {
                md.push_str(&format!("\n{} redundant dependencies\n", redundant));
            }
            md
        }
    }
}

/// Render the members of a project.
pub fn format_members(members: &[ProjectMember], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_pretty(&json!(members)),
        OutputFormat::Markdown => {
            let mut md = String::from("| user | name | email | role |\n|---|---|---|---|\n");
            for member in members {
                let user = &member.user;
                md.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    user.id,
                    user.full_name.as_deref().unwrap_or(""),
                    user.email.as_deref().unwrap_or(""),
                    user.role.as_str()
                ));
            }
            md
        }
    }
}

/// One-line rendering of a notification for the watch log.
pub fn format_notification(notification: &Notification) -> String {
    let when = Local
        .timestamp_millis_opt(notification.ts)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    format!(
        "[{}] {:<7} {} ({})",
        when,
        notification.kind.as_str(),
        notification.text,
        notification.link
    )
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn to_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::allowed_transitions;
    use crate::notifications::NotificationKind;
    use crate::types::{AnalysisEdge, AnalysisNode, Dependency, Role, Task, TaskStatus, User};

    fn snapshot() -> GraphSnapshot {
        GraphSnapshot::new(
            1,
            vec![
                Task::new(1, 1, "design", TaskStatus::InProgress),
                Task::new(2, 1, "build", TaskStatus::Backlog),
            ],
            vec![Dependency::new(2, 1)],
            None,
        )
    }

    #[test]
    fn markdown_lists_blockers() {
        let snap = snapshot();
        let allowed = allowed_transitions(&snap, 2);
        let md = format_transitions(&snap, 2, &allowed, OutputFormat::Markdown);
        assert!(md.contains("## Task #2: build"));
        assert!(md.contains("- **can_start**: no"));
        assert!(md.contains("- **blocked_by**: #1"));
    }

    #[test]
    fn unknown_predecessors_are_listed_apart() {
        let mut snap = snapshot();
        snap.edges.push(Dependency::new(2, 404));
        let allowed = allowed_transitions(&snap, 2);

        let md = format_transitions(&snap, 2, &allowed, OutputFormat::Markdown);
        assert!(md.contains("- **blocked_by**: #1\n"));
        assert!(md.contains("- **unknown_predecessors**: #404"));

        let out = format_transitions(&snap, 2, &allowed, OutputFormat::Json);
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["unknown_predecessors"], json!([404]));
    }

    #[test]
    fn members_table() {
        let members = vec![ProjectMember {
            id: 1,
            project_id: 3,
            user: User {
                id: 7,
                email: Some("ada@example.com".into()),
                full_name: Some("Ada".into()),
                role: Role::Executor,
            },
        }];
        let md = format_members(&members, OutputFormat::Markdown);
        assert!(md.contains("| 7 | Ada | ada@example.com | executor |"));

        let value: Value = serde_json::from_str(&format_members(&members, OutputFormat::Json)).unwrap();
        assert_eq!(value[0]["user"]["id"], 7);
    }

    #[test]
    fn json_transitions() {
        let snap = snapshot();
        let allowed = allowed_transitions(&snap, 1);
        let out = format_transitions(&snap, 1, &allowed, OutputFormat::Json);
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["can_complete"], true);
        assert_eq!(value["status"], "in_progress");
    }

    #[test]
    fn analysis_markdown_shows_critical_path() {
        let analysis = GraphAnalysis {
            project_id: 1,
            duration: 5,
            critical_path: vec![1, 2],
            nodes: vec![AnalysisNode {
                id: 1,
                name: "design".into(),
                duration: 2,
                es: 0,
                ef: 2,
                ls: 0,
                lf: 2,
                slack: 0,
                is_critical: true,
                status: Some(TaskStatus::Done),
            }],
            edges: vec![AnalysisEdge {
                source: 1,
                target: 2,
                dependency_type: "blocks".into(),
                redundant: true,
            }],
        };
        let md = format_analysis(&analysis, OutputFormat::Markdown);
        assert!(md.contains("**Critical path**: #1 -> #2"));
        assert!(md.contains("| 1 | design | 0 | 2 | 0 | 2 | 0 | yes |"));
        assert!(md.contains("1 redundant dependencies"));
    }

    #[test]
    fn notification_line() {
        let mut n = Notification::new(NotificationKind::Deps, "Task #4 can start", "/tasks");
        n.ts = 1_700_000_000_000;
        let line = format_notification(&n);
        assert!(line.contains("deps"));
        assert!(line.ends_with("Task #4 can start (/tasks)"));
    }

    #[test]
    fn format_names() {
        assert_eq!(OutputFormat::from_str("MD"), Some(OutputFormat::Markdown));
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("yaml"), None);
    }
}
