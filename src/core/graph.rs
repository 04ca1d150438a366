//! Persisted task graph for a team.
//!
//! Each task lives in its own file under `teams/<team>/tasks/`. Every
//! operation that touches more than one task file runs inside the team's
//! tasks lock, on the blocking pool, and emits its events after the lock
//! has been released.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::json;

use crate::agent::AgentId;
use crate::core::dag::DependencyGraph;
use crate::core::task::{dependency_warning, NewTask, Task, TaskId, TaskPatch, TaskStatus};
use crate::orchestration::bus::{DispatchEvent, EventBus, EventKind};
use crate::state::{Layout, Store};
use crate::util::{blocking, validate_name};
use crate::{tlog, tlog_debug, Error, Result};

/// Why an agent's tasks went back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignReason {
    Inactive,
    Terminated,
    ShutDown,
}

impl ReassignReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReassignReason::Inactive => "inactive",
            ReassignReason::Terminated => "terminated",
            ReassignReason::ShutDown => "shut_down",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ReassignReason::Inactive => "stopped sending heartbeats",
            ReassignReason::Terminated => "was terminated",
            ReassignReason::ShutDown => "shut down",
        }
    }
}

/// Outcome of [`TaskGraph::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Dependencies removed because they were completed or missing.
    pub dropped_dependencies: usize,
    /// Task files rewritten.
    pub rewritten: usize,
}

/// Task file access for one team. Callers hold the tasks lock.
struct TaskFiles {
    store: Store,
    layout: Layout,
    team: String,
}

impl TaskFiles {
    fn require_team(&self) -> Result<()> {
        if self.layout.team_file(&self.team).is_file() {
            Ok(())
        } else {
            Err(Error::TeamNotFound(self.team.clone()))
        }
    }

    fn read(&self, id: &TaskId) -> Result<Task> {
        self.store
            .read_validated(&self.layout.task_file(&self.team, id))
            .map_err(|e| match e {
                Error::FileNotFound(_) => Error::TaskNotFound(id.to_string()),
                other => other,
            })
    }

    fn read_optional(&self, id: &TaskId) -> Result<Option<Task>> {
        self.store
            .read_optional(&self.layout.task_file(&self.team, id))
    }

    fn write(&self, task: &Task) -> Result<()> {
        self.store
            .write_atomic(&self.layout.task_file(&self.team, &task.id), task)
    }

    fn remove(&self, id: &TaskId) -> Result<()> {
        self.store.remove(&self.layout.task_file(&self.team, id))
    }

    /// All tasks in creation order.
    fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.store.list_json(&self.layout.tasks_dir(&self.team))?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Check that every id exists. Returns the ids deduplicated, in the
    /// order given, each paired with whether it is completed.
    fn resolve_dependencies(&self, deps: &[TaskId]) -> Result<Vec<(TaskId, bool)>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for dep in deps {
            if !seen.insert(*dep) {
                continue;
            }
            let task = self
                .read_optional(dep)?
                .ok_or_else(|| Error::DependencyNotFound(dep.to_string()))?;
            resolved.push((*dep, task.is_completed()));
        }
        Ok(resolved)
    }
}

/// Resolved dependencies that still need to be recorded.
fn open_dependencies(resolved: &[(TaskId, bool)]) -> Vec<TaskId> {
    resolved
        .iter()
        .filter(|(_, completed)| !completed)
        .map(|(id, _)| *id)
        .collect()
}

/// Unmet dependencies of `task`: those that still exist and are not completed.
fn unmet_dependencies(files: &TaskFiles, task: &Task) -> Result<Vec<TaskId>> {
    let mut unmet = Vec::new();
    for dep in &task.dependencies {
        if let Some(dep_task) = files.read_optional(dep)? {
            if !dep_task.is_completed() {
                unmet.push(*dep);
            }
        }
    }
    Ok(unmet)
}

/// Result of a locked update, carried out of the critical section so the
/// events can be emitted afterwards.
struct UpdateOutcome {
    task: Task,
    completed: bool,
    unblocked: Vec<Task>,
    changes: Vec<&'static str>,
}

/// The shared task dependency graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    store: Store,
    layout: Layout,
    bus: EventBus,
}

impl TaskGraph {
    pub fn new(store: Store, layout: Layout, bus: EventBus) -> Self {
        Self { store, layout, bus }
    }

    fn files(&self, team: &str) -> TaskFiles {
        TaskFiles {
            store: self.store,
            layout: self.layout.clone(),
            team: team.to_string(),
        }
    }

    /// Run `f` on the blocking pool while holding the team's tasks lock.
    async fn with_tasks_locked<R, F>(&self, team: &str, f: F) -> Result<R>
    where
        F: FnOnce(&TaskFiles) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        validate_name("Team", team)?;
        let files = self.files(team);
        blocking(move || {
            let lock = files.layout.tasks_lock(&files.team);
            files.store.locks().with_lock(&lock, || f(&files))
        })
        .await
    }

    async fn emit(&self, kind: EventKind, team: &str, payload: serde_json::Value) {
        self.bus.emit(DispatchEvent::new(kind, team, payload)).await;
    }

    /// Create a pending task depending on `dependencies`.
    ///
    /// Every dependency must exist. Dependencies that are already completed
    /// are satisfied and not recorded. No cycle check is needed: nothing can
    /// depend on a task that does not exist yet.
    pub async fn create_task(
        &self,
        team: &str,
        fields: NewTask,
        dependencies: &[TaskId],
    ) -> Result<Task> {
        let dependencies = dependencies.to_vec();
        let task = self
            .with_tasks_locked(team, move |files| {
                files.require_team()?;
                let open = open_dependencies(&files.resolve_dependencies(&dependencies)?);

                let mut task = Task::new(fields);
                task.dependencies = open;
                files.write(&task)?;

                for dep in &task.dependencies {
                    let mut dep_task = files.read(dep)?;
                    dep_task.add_blocked(task.id);
                    dep_task.touch();
                    files.write(&dep_task)?;
                }
                Ok(task)
            })
            .await?;

        tlog!("Task {} created in team {}: {}", task.id.short(), team, task.title);
        self.emit(
            EventKind::TaskCreated,
            team,
            json!({
                "task_id": task.id,
                "title": task.title,
                "priority": task.priority,
                "dependencies": task.dependencies,
            }),
        )
        .await;
        Ok(task)
    }

    /// Apply `patch` to a task.
    ///
    /// Status changes must follow pending -> in_progress -> completed.
    /// Dependency edits are checked for cycles before anything is written,
    /// and `blocks` on added and removed dependencies is kept in step. A
    /// transition into completed unblocks the task's direct dependents.
    pub async fn update_task(&self, team: &str, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let id = *id;
        let outcome = self
            .with_tasks_locked(team, move |files| apply_update(files, id, patch))
            .await?;

        let task = &outcome.task;
        if outcome.completed {
            tlog!(
                "Task {} completed in team {}, unblocked {}",
                task.id.short(),
                team,
                outcome.unblocked.len()
            );
            self.emit(
                EventKind::TaskCompleted,
                team,
                json!({
                    "task_id": task.id,
                    "title": task.title,
                    "owner": task.owner,
                    "unblocked": outcome.unblocked.iter().map(|t| t.id).collect::<Vec<_>>(),
                }),
            )
            .await;
            for dependent in &outcome.unblocked {
                self.emit(
                    EventKind::TaskUnblocked,
                    team,
                    json!({
                        "task_id": dependent.id,
                        "title": dependent.title,
                        "unblocked_by": task.id,
                    }),
                )
                .await;
            }
        } else {
            tlog_debug!("Task {} updated: {:?}", task.id.short(), outcome.changes);
            self.emit(
                EventKind::TaskUpdated,
                team,
                json!({
                    "task_id": task.id,
                    "title": task.title,
                    "status": task.status,
                    "owner": task.owner,
                    "changes": outcome.changes,
                }),
            )
            .await;
        }
        Ok(outcome.task)
    }

    /// Claim a pending task for `agent`.
    ///
    /// The status check and the write happen under one lock, so among
    /// concurrent claimers exactly one succeeds; the rest get `Contention`.
    /// Claiming with unmet dependencies is allowed but attaches a warning.
    pub async fn claim_task(&self, team: &str, id: &TaskId, agent: &AgentId) -> Result<Task> {
        validate_name("Team", team)?;
        validate_name("Agent", agent.as_str())?;
        let id = *id;
        let owner = agent.clone();
        let files = self.files(team);

        let task = blocking(move || {
            let lock = files.layout.tasks_lock(&files.team);
            let path = files.layout.task_file(&files.team, &id);
            files
                .store
                .locked_update(&lock, &path, |task: &mut Task| {
                    if task.status != TaskStatus::Pending {
                        let reason = match &task.owner {
                            Some(current) => format!("already claimed by {}", current),
                            None => format!("status is {}", task.status),
                        };
                        return Err(Error::Contention {
                            id: id.to_string(),
                            reason,
                        });
                    }

                    let unmet = unmet_dependencies(&files, task)?;
                    let now = Utc::now();
                    task.status = TaskStatus::InProgress;
                    task.owner = Some(owner);
                    task.claimed_at = Some(now);
                    task.warning = if unmet.is_empty() {
                        None
                    } else {
                        Some(dependency_warning(&unmet))
                    };
                    task.updated_at = now;
                    Ok(task.clone())
                })
                .map_err(|e| match e {
                    Error::FileNotFound(_) => Error::TaskNotFound(id.to_string()),
                    other => other,
                })
        })
        .await?;

        tlog!("Task {} claimed by {} in team {}", task.id.short(), agent, team);
        self.emit(
            EventKind::TaskClaimed,
            team,
            json!({
                "task_id": task.id,
                "title": task.title,
                "agent_id": agent,
                "warning": task.warning,
            }),
        )
        .await;
        Ok(task)
    }

    /// Return every in-progress task owned by `agent` to pending.
    ///
    /// This is the only way a task moves back from in_progress. Owner and
    /// claim time are cleared and a warning records why.
    pub(crate) async fn reassign_agent_tasks(
        &self,
        team: &str,
        agent: &AgentId,
        reason: ReassignReason,
    ) -> Result<Vec<Task>> {
        let owners = HashMap::from([(agent.clone(), reason)]);
        let reassigned = self.reassign_owned_by(team, owners).await?;
        Ok(reassigned.into_iter().map(|(_, task)| task).collect())
    }

    /// [`reassign_agent_tasks`](Self::reassign_agent_tasks) for several
    /// agents in one locked pass. Each task comes back with its previous
    /// owner.
    pub(crate) async fn reassign_owned_by(
        &self,
        team: &str,
        owners: HashMap<AgentId, ReassignReason>,
    ) -> Result<Vec<(AgentId, Task)>> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let reassigned = self
            .with_tasks_locked(team, move |files| {
                let mut reassigned = Vec::new();
                for mut task in files.list()? {
                    if task.status != TaskStatus::InProgress {
                        continue;
                    }
                    let Some((owner, reason)) = task
                        .owner
                        .as_ref()
                        .and_then(|owner| owners.get_key_value(owner))
                    else {
                        continue;
                    };
                    let owner = owner.clone();
                    task.status = TaskStatus::Pending;
                    task.owner = None;
                    task.claimed_at = None;
                    task.warning = Some(format!(
                        "Reassigned: previous owner {} {}",
                        owner,
                        reason.describe()
                    ));
                    task.touch();
                    files.write(&task)?;
                    reassigned.push((owner, *reason, task));
                }
                Ok(reassigned)
            })
            .await?;

        if !reassigned.is_empty() {
            tlog!("Reassigned {} task(s) in team {}", reassigned.len(), team);
        }
        for (owner, reason, task) in &reassigned {
            self.emit(
                EventKind::TaskReassigned,
                team,
                json!({
                    "task_id": task.id,
                    "title": task.title,
                    "previous_owner": owner,
                    "reason": reason.as_str(),
                }),
            )
            .await;
        }
        Ok(reassigned
            .into_iter()
            .map(|(owner, _, task)| (owner, task))
            .collect())
    }

    /// Delete a task nothing depends on.
    pub async fn delete_task(&self, team: &str, id: &TaskId) -> Result<Task> {
        let id = *id;
        let task = self
            .with_tasks_locked(team, move |files| {
                let task = files.read(&id)?;
                let tasks = files.list()?;
                let dependents: Vec<String> = DependencyGraph::from_tasks(&tasks)
                    .dependents_of(&id)
                    .into_iter()
                    .filter(|dependent| *dependent != id)
                    .map(|dependent| dependent.to_string())
                    .collect();
                if !dependents.is_empty() {
                    return Err(Error::ReferentialIntegrity {
                        id: id.to_string(),
                        dependents,
                    });
                }

                for dep in &task.dependencies {
                    if let Some(mut dep_task) = files.read_optional(dep)? {
                        dep_task.remove_blocked(&id);
                        dep_task.touch();
                        files.write(&dep_task)?;
                    }
                }
                files.remove(&id)?;
                Ok(task)
            })
            .await?;

        tlog!("Task {} deleted from team {}", task.id.short(), team);
        self.emit(
            EventKind::TaskDeleted,
            team,
            json!({ "task_id": task.id, "title": task.title }),
        )
        .await;
        Ok(task)
    }

    pub async fn get_task(&self, team: &str, id: &TaskId) -> Result<Task> {
        validate_name("Team", team)?;
        let files = self.files(team);
        let id = *id;
        blocking(move || files.read(&id)).await
    }

    /// Every task of the team, oldest first.
    pub async fn list_tasks(&self, team: &str) -> Result<Vec<Task>> {
        validate_name("Team", team)?;
        let files = self.files(team);
        blocking(move || {
            files.require_team()?;
            files.list()
        })
        .await
    }

    /// Pending tasks whose dependencies are all satisfied, oldest first.
    pub async fn ready_tasks(&self, team: &str) -> Result<Vec<Task>> {
        let tasks = self.list_tasks(team).await?;
        Ok(ready_from(&tasks))
    }

    /// Task ids with every task after its dependencies.
    pub async fn topological_order(&self, team: &str) -> Result<Vec<TaskId>> {
        let tasks = self.list_tasks(team).await?;
        DependencyGraph::from_tasks(&tasks).topological_order()
    }

    /// Repair the graph after a crash part-way through a multi-file update.
    ///
    /// Drops dependencies on completed or missing tasks, clears dependency
    /// warnings that no longer apply and rebuilds every `blocks` list as the
    /// transpose of `dependencies`.
    pub async fn reconcile(&self, team: &str) -> Result<ReconcileReport> {
        let report = self
            .with_tasks_locked(team, |files| {
                files.require_team()?;
                let tasks = files.list()?;
                let status: HashMap<TaskId, TaskStatus> =
                    tasks.iter().map(|t| (t.id, t.status)).collect();

                let mut report = ReconcileReport::default();
                let mut repaired: Vec<Task> = tasks.clone();
                for task in repaired.iter_mut() {
                    let before = task.dependencies.len();
                    task.dependencies.retain(|dep| {
                        matches!(status.get(dep), Some(s) if *s != TaskStatus::Completed)
                    });
                    report.dropped_dependencies += before - task.dependencies.len();
                    if task.dependencies.is_empty() && task.has_dependency_warning() {
                        task.warning = None;
                    }
                }

                let mut blocks: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
                for task in &repaired {
                    for dep in &task.dependencies {
                        blocks.entry(*dep).or_default().push(task.id);
                    }
                }
                for task in repaired.iter_mut() {
                    task.blocks = blocks.remove(&task.id).unwrap_or_default();
                }

                for (before, mut after) in tasks.into_iter().zip(repaired) {
                    if before != after {
                        after.touch();
                        files.write(&after)?;
                        report.rewritten += 1;
                    }
                }
                Ok(report)
            })
            .await?;

        if report.rewritten > 0 {
            tlog!(
                "Reconciled team {}: {} task(s) rewritten, {} dependency edge(s) dropped",
                team,
                report.rewritten,
                report.dropped_dependencies
            );
        }
        Ok(report)
    }
}

/// Pending tasks with no unmet dependency, in the order given.
pub(crate) fn ready_from(tasks: &[Task]) -> Vec<Task> {
    let done: HashSet<TaskId> = tasks
        .iter()
        .filter(|t| t.is_completed())
        .map(|t| t.id)
        .collect();
    let known: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies
                .iter()
                .all(|dep| done.contains(dep) || !known.contains(dep))
        })
        .cloned()
        .collect()
}

fn apply_update(files: &TaskFiles, id: TaskId, patch: TaskPatch) -> Result<UpdateOutcome> {
    let current = files.read(&id)?;
    let mut next = current.clone();
    let mut changes = Vec::new();

    if let Some(status) = patch.status {
        if !current.status.can_transition_to(status) {
            return Err(Error::InvalidStatusTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        if status != current.status {
            next.status = status;
            changes.push("status");
            let now = Utc::now();
            match status {
                TaskStatus::InProgress => {
                    next.claimed_at.get_or_insert(now);
                }
                TaskStatus::Completed => next.completed_at = Some(now),
                TaskStatus::Pending => {}
            }
        }
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    if let Some(deps) = patch.dependencies {
        let resolved = files.resolve_dependencies(&deps)?;
        let proposed: Vec<TaskId> = resolved.iter().map(|(dep, _)| *dep).collect();
        // Completed tasks keep the edges they had when claimed early, so
        // they are walked too.
        let tasks = files.list()?;
        if let Some(via) = DependencyGraph::from_tasks(&tasks).find_cycle(&id, &proposed) {
            return Err(Error::CircularDependency {
                task: id.to_string(),
                via: via.to_string(),
            });
        }
        let open = open_dependencies(&resolved);
        added = open
            .iter()
            .filter(|d| !current.dependencies.contains(d))
            .copied()
            .collect();
        removed = current
            .dependencies
            .iter()
            .filter(|d| !open.contains(d))
            .copied()
            .collect();
        if next.dependencies != open {
            next.dependencies = open;
            changes.push("dependencies");
        }
    }

    if let Some(title) = patch.title {
        next.title = title;
        changes.push("title");
    }
    if let Some(description) = patch.description {
        next.description = description;
        changes.push("description");
    }
    if let Some(priority) = patch.priority {
        next.priority = priority;
        changes.push("priority");
    }
    if let Some(owner) = patch.owner {
        if let Some(agent) = &owner {
            validate_name("Agent", agent.as_str())?;
        }
        next.owner = owner;
        changes.push("owner");
    }
    if let Some(warning) = patch.warning {
        next.warning = warning;
        changes.push("warning");
    }

    next.id = current.id;
    next.created_at = current.created_at;
    next.touch();
    files.write(&next)?;

    for dep in &added {
        let mut dep_task = files.read(dep)?;
        dep_task.add_blocked(id);
        dep_task.touch();
        files.write(&dep_task)?;
    }
    for dep in &removed {
        if let Some(mut dep_task) = files.read_optional(dep)? {
            dep_task.remove_blocked(&id);
            dep_task.touch();
            files.write(&dep_task)?;
        }
    }

    let completed = current.status != TaskStatus::Completed && next.status == TaskStatus::Completed;
    let unblocked = if completed {
        cascade_unblock(files, &mut next)?
    } else {
        Vec::new()
    };

    Ok(UpdateOutcome {
        task: next,
        completed,
        unblocked,
        changes,
    })
}

/// Detach a freshly completed task from its direct dependents.
///
/// Dependents are written first and the completed task's `blocks` last, so
/// a crash in between leaves state `reconcile` can repair. Returns the
/// dependents left with no dependencies.
fn cascade_unblock(files: &TaskFiles, completed: &mut Task) -> Result<Vec<Task>> {
    let mut unblocked = Vec::new();
    for dependent_id in completed.blocks.clone() {
        let Some(mut dependent) = files.read_optional(&dependent_id)? else {
            continue;
        };
        dependent.dependencies.retain(|d| *d != completed.id);
        if dependent.has_dependency_warning() {
            let remaining = unmet_dependencies(files, &dependent)?;
            dependent.warning = if remaining.is_empty() {
                None
            } else {
                Some(dependency_warning(&remaining))
            };
        }
        dependent.touch();
        files.write(&dependent)?;
        if dependent.dependencies.is_empty() {
            unblocked.push(dependent);
        }
    }

    completed.blocks.clear();
    files.write(completed)?;
    Ok(unblocked)
}
