//! Task planner + executor (C6) — decomposes a query into a DAG of tasks
//! and runs it to completion, one ready task at a time, via nested agent
//! turns. Distinct from [`super::tasks`]'s flat concurrent turn queue: a
//! `TaskPlan` here is the unit of work for a single complex query, not a
//! persisted multi-turn job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use sa_domain::tool::Message;
use sa_providers::{ChatRequest, LlmProvider};

use crate::state::AppState;

use super::{run_turn, TurnEvent, TurnInput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl Default for PlanTaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: PlanTaskStatus,
    #[serde(default)]
    pub tool_calls: Vec<PlannedToolCall>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub query: String,
    pub tasks: Vec<PlanTask>,
    pub created_at: DateTime<Utc>,
}

/// Events forwarded to the caller while a plan executes, mirroring the
/// task-id-tagged turn events `super::tasks` already streams over SSE.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PlanEvent {
    #[serde(rename = "task.started")]
    TaskStarted { task_id: String },
    #[serde(rename = "task.turn_event")]
    TaskTurnEvent {
        task_id: String,
        #[serde(flatten)]
        event: TurnEvent,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: String, result: String },
    #[serde(rename = "task.failed")]
    TaskFailed { task_id: String, error: String },
    #[serde(rename = "plan.blocked")]
    PlanBlocked { reason: String },
    #[serde(rename = "plan.done")]
    PlanDone,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct RawPlan {
    tasks: Vec<RawTask>,
}

#[derive(Deserialize)]
struct RawTask {
    id: String,
    description: String,
    #[serde(default, rename = "toolCalls")]
    tool_calls: Vec<PlannedToolCall>,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn empty_plan(query: &str, reason: String) -> (TaskPlan, Option<String>) {
    (
        TaskPlan {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            tasks: Vec::new(),
            created_at: Utc::now(),
        },
        Some(reason),
    )
}

/// Ask the LLM for an execution plan and validate it. Any validation
/// failure returns an empty plan plus a debug message rather than an
/// error — a bad plan degrades to "no decomposition", not a crash.
pub async fn plan_tasks(
    planner: &Arc<dyn LlmProvider>,
    query: &str,
    tool_catalog: &[String],
) -> (TaskPlan, Option<String>) {
    let prompt = format!(
        "Decompose this query into a task execution plan as JSON: \
         {{\"tasks\": [{{\"id\": string, \"description\": string, \
         \"toolCalls\": [{{\"tool\": string, \"args\": object}}], \
         \"dependencies\": [id, ...]}}]}}. An empty toolCalls array marks a \
         synthesis task that only combines the results of its dependencies.\n\
         Available tools: {}\nQuery: {query}",
        tool_catalog.join(", ")
    );
    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        json_mode: true,
        ..Default::default()
    };

    let raw = match planner.chat(req).await {
        Ok(resp) => resp.content,
        Err(e) => return empty_plan(query, format!("planner call failed: {e}")),
    };

    let parsed: RawPlan = match serde_json::from_str(&raw) {
        Ok(p) => p,
        Err(e) => return empty_plan(query, format!("planner returned invalid JSON: {e}")),
    };

    if let Err(reason) = validate_plan(&parsed.tasks) {
        return empty_plan(query, reason);
    }

    let tasks = parsed
        .tasks
        .into_iter()
        .map(|t| PlanTask {
            id: t.id,
            description: t.description,
            status: PlanTaskStatus::Pending,
            tool_calls: t.tool_calls,
            dependencies: t.dependencies,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        })
        .collect();

    (
        TaskPlan {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            tasks,
            created_at: Utc::now(),
        },
        None,
    )
}

/// Unique ids, resolvable dependency references, and a DAG (DFS with an
/// explicit recursion stack to catch cycles).
fn validate_plan(tasks: &[RawTask]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for t in tasks {
        if !seen.insert(t.id.as_str()) {
            return Err(format!("duplicate task id: {}", t.id));
        }
    }
    for t in tasks {
        for dep in &t.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(format!("task {} depends on unknown id {dep}", t.id));
            }
        }
    }

    let by_id: HashMap<&str, &RawTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    for t in tasks {
        if !visited.contains(t.id.as_str())
            && has_cycle(t.id.as_str(), &by_id, &mut visiting, &mut visited)
        {
            return Err("dependency graph contains a cycle".to_string());
        }
    }
    Ok(())
}

fn has_cycle<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a RawTask>,
    visiting: &mut HashSet<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> bool {
    if visiting.contains(id) {
        return true;
    }
    if visited.contains(id) {
        return false;
    }
    visiting.insert(id);
    if let Some(task) = by_id.get(id) {
        for dep in &task.dependencies {
            if has_cycle(dep.as_str(), by_id, visiting, visited) {
                return true;
            }
        }
    }
    visiting.remove(id);
    visited.insert(id);
    false
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn ready_tasks(tasks: &[PlanTask]) -> Vec<usize> {
    let complete: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == PlanTaskStatus::Complete)
        .map(|t| t.id.as_str())
        .collect();
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.status == PlanTaskStatus::Pending
                && t.dependencies.iter().all(|d| complete.contains(d.as_str()))
        })
        .map(|(i, _)| i)
        .collect()
}

fn build_task_query(task: &PlanTask, tasks: &[PlanTask]) -> String {
    let dep_results: String = task
        .dependencies
        .iter()
        .filter_map(|dep_id| tasks.iter().find(|t| &t.id == dep_id))
        .map(|t| format!("- {}: {}", t.id, t.result.clone().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n");

    if task.tool_calls.is_empty() {
        format!("{}\n\nContext:\n{dep_results}", task.description)
    } else {
        let calls_json = serde_json::to_string(&task.tool_calls).unwrap_or_default();
        format!(
            "{}\n\nContext:\n{dep_results}\n\nRequired tool calls: {calls_json}",
            task.description
        )
    }
}

/// Execute a validated plan to completion, running each ready task as a
/// nested agent turn and forwarding its events tagged with the task id.
/// Readiness is re-evaluated after every task transition; tasks at the
/// same dependency depth may run sequentially — the only hard rule is
/// that a task never starts before all its dependencies are `Complete`.
pub async fn execute_plan(
    state: &AppState,
    plan: &mut TaskPlan,
    parent_session_key: &str,
    tx: mpsc::Sender<PlanEvent>,
) -> Result<(), String> {
    loop {
        let ready = ready_tasks(&plan.tasks);
        if ready.is_empty() {
            let unfinished = plan
                .tasks
                .iter()
                .any(|t| matches!(t.status, PlanTaskStatus::Pending | PlanTaskStatus::Running));
            if unfinished {
                let reason = "blocked: cycle or cascading failure".to_string();
                let _ = tx
                    .send(PlanEvent::PlanBlocked {
                        reason: reason.clone(),
                    })
                    .await;
                return Err(reason);
            }
            break;
        }

        for idx in ready {
            let task_id = plan.tasks[idx].id.clone();
            plan.tasks[idx].status = PlanTaskStatus::Running;
            plan.tasks[idx].start_time = Some(Utc::now());
            let _ = tx
                .send(PlanEvent::TaskStarted {
                    task_id: task_id.clone(),
                })
                .await;

            let query = build_task_query(&plan.tasks[idx], &plan.tasks);
            let (result, errored) =
                run_task_turn(state, parent_session_key, &task_id, &query, &tx).await;

            let task = &mut plan.tasks[idx];
            task.end_time = Some(Utc::now());
            if errored {
                task.status = PlanTaskStatus::Failed;
                task.error = Some(result.clone());
                let _ = tx
                    .send(PlanEvent::TaskFailed {
                        task_id,
                        error: result,
                    })
                    .await;
            } else {
                task.status = PlanTaskStatus::Complete;
                task.result = Some(result.clone());
                let _ = tx
                    .send(PlanEvent::TaskCompleted { task_id, result })
                    .await;
            }
        }
    }

    let _ = tx.send(PlanEvent::PlanDone).await;
    Ok(())
}

async fn run_task_turn(
    state: &AppState,
    parent_session_key: &str,
    task_id: &str,
    query: &str,
    tx: &mpsc::Sender<PlanEvent>,
) -> (String, bool) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let session_key = format!("{parent_session_key}:plan-task:{task_id}");

    let input = TurnInput {
        session_key,
        session_id,
        user_message: query.to_string(),
        model: None,
        response_format: None,
        agent: None,
        routing_profile: None,
    };

    let (_run_id, mut rx) = run_turn(state.clone(), input);

    let mut result = String::new();
    let mut errored = false;
    while let Some(event) = rx.recv().await {
        match &event {
            TurnEvent::Final { content } => result = content.clone(),
            TurnEvent::Stopped { content } => {
                result = if content.is_empty() {
                    "[task stopped]".to_string()
                } else {
                    content.clone()
                };
            }
            TurnEvent::Error { message } => {
                result = message.clone();
                errored = true;
            }
            _ => {}
        }
        let _ = tx
            .send(PlanEvent::TaskTurnEvent {
                task_id: task_id.to_string(),
                event,
            })
            .await;
    }

    (result, errored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            id: id.to_string(),
            description: String::new(),
            status: PlanTaskStatus::Pending,
            tool_calls: Vec::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn validate_plan_rejects_duplicate_ids() {
        let tasks = vec![
            RawTask {
                id: "a".into(),
                description: "x".into(),
                tool_calls: vec![],
                dependencies: vec![],
            },
            RawTask {
                id: "a".into(),
                description: "y".into(),
                tool_calls: vec![],
                dependencies: vec![],
            },
        ];
        assert!(validate_plan(&tasks).is_err());
    }

    #[test]
    fn validate_plan_rejects_unresolved_dependency() {
        let tasks = vec![RawTask {
            id: "a".into(),
            description: "x".into(),
            tool_calls: vec![],
            dependencies: vec!["ghost".into()],
        }];
        assert!(validate_plan(&tasks).is_err());
    }

    #[test]
    fn validate_plan_rejects_cycle() {
        let tasks = vec![
            RawTask {
                id: "a".into(),
                description: "x".into(),
                tool_calls: vec![],
                dependencies: vec!["b".into()],
            },
            RawTask {
                id: "b".into(),
                description: "y".into(),
                tool_calls: vec![],
                dependencies: vec!["a".into()],
            },
        ];
        assert!(validate_plan(&tasks).is_err());
    }

    #[test]
    fn validate_plan_accepts_valid_dag() {
        let tasks = vec![
            RawTask {
                id: "a".into(),
                description: "x".into(),
                tool_calls: vec![],
                dependencies: vec![],
            },
            RawTask {
                id: "b".into(),
                description: "y".into(),
                tool_calls: vec![],
                dependencies: vec!["a".into()],
            },
        ];
        assert!(validate_plan(&tasks).is_ok());
    }

    #[test]
    fn ready_tasks_only_includes_pending_with_satisfied_deps() {
        let mut tasks = vec![task("a", &[]), task("b", &["a"])];
        assert_eq!(ready_tasks(&tasks), vec![0]);
        tasks[0].status = PlanTaskStatus::Complete;
        assert_eq!(ready_tasks(&tasks), vec![1]);
    }

    #[test]
    fn build_task_query_includes_dependency_results() {
        let mut tasks = vec![task("a", &[]), task("b", &["a"])];
        tasks[0].result = Some("result-a".to_string());
        tasks[1].description = "synthesize".to_string();
        let query = build_task_query(&tasks[1], &tasks);
        assert!(query.contains("synthesize"));
        assert!(query.contains("result-a"));
    }

    #[test]
    fn build_task_query_includes_tool_calls_when_present() {
        let mut t = task("a", &[]);
        t.tool_calls.push(PlannedToolCall {
            tool: "search".to_string(),
            args: serde_json::json!({"q": "rust"}),
        });
        let query = build_task_query(&t, &[t.clone()]);
        assert!(query.contains("Required tool calls"));
        assert!(query.contains("search"));
    }
}
