//! The task engine: a dependency DAG with content-hash caching.
//!
//! Tasks are discovered from configuration, wired with static edges per
//! task kind, and executed in topological order. Each task consults its
//! persisted [`TaskRecord`]: when the declared inputs fingerprint matches
//! and every declared output exists, the task is skipped. A failure aborts
//! everything downstream of it; independent subgraphs keep running.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use alto_types::task::{TaskId, TaskRecord, TaskStatus};
use alto_types::{AltoError, Result};

use crate::fingerprint::task_fingerprint;
use crate::pipeline::Shutdown;

/// How a task decides whether it needs to run.
pub enum Freshness<'a> {
    /// Run on every request (pipelines, config rendering).
    Always,
    /// Skip when the inputs fingerprint matches the stored record and all
    /// declared outputs exist.
    Fingerprint,
    /// Custom probe; returning `true` means up-to-date (used by tasks
    /// whose cache lives on the storage backend).
    Probe(Box<dyn Fn() -> Result<bool> + Send + Sync + 'a>),
}

type Action<'a> = Box<dyn Fn() -> Result<()> + Send + Sync + 'a>;

/// One node of the DAG.
pub struct Task<'a> {
    pub id: TaskId,
    pub doc: String,
    deps: Vec<TaskId>,
    input_files: Vec<PathBuf>,
    params: BTreeMap<String, String>,
    outputs: Vec<PathBuf>,
    freshness: Freshness<'a>,
    action: Action<'a>,
    clean: Option<Action<'a>>,
}

impl<'a> Task<'a> {
    /// A task that always runs, with no declared inputs or outputs.
    pub fn new(
        id: TaskId,
        doc: impl Into<String>,
        action: impl Fn() -> Result<()> + Send + Sync + 'a,
    ) -> Self {
        Self {
            id,
            doc: doc.into(),
            deps: Vec::new(),
            input_files: Vec::new(),
            params: BTreeMap::new(),
            outputs: Vec::new(),
            freshness: Freshness::Always,
            action: Box::new(action),
            clean: None,
        }
    }

    #[must_use]
    pub fn dep(mut self, dep: TaskId) -> Self {
        self.deps.push(dep);
        self
    }

    #[must_use]
    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_files.push(path.into());
        self
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    #[must_use]
    pub fn freshness(mut self, freshness: Freshness<'a>) -> Self {
        self.freshness = freshness;
        self
    }

    #[must_use]
    pub fn clean_action(
        mut self,
        clean: impl Fn() -> Result<()> + Send + Sync + 'a,
    ) -> Self {
        self.clean = Some(Box::new(clean));
        self
    }

    fn fingerprint(&self) -> Result<String> {
        let files: Vec<&Path> = self.input_files.iter().map(PathBuf::as_path).collect();
        task_fingerprint(&files, &self.params)
    }

    fn outputs_exist(&self) -> bool {
        self.outputs.iter().all(|path| path.exists())
    }
}

// ---------------------------------------------------------------------------
// Task records
// ---------------------------------------------------------------------------

/// The persisted record file at the project root, written only by the
/// coordinating process.
#[derive(Debug)]
pub struct TaskDb {
    path: PathBuf,
    records: BTreeMap<TaskId, TaskRecord>,
}

impl TaskDb {
    /// Load the record file, tolerating a missing one.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Serde`] when the file exists but is corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, records })
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn upsert(&mut self, record: TaskRecord) {
        self.records.insert(record.task_id.clone(), record);
    }

    pub fn forget(&mut self, id: &TaskId) {
        self.records.remove(id);
    }

    /// Write the record file via a temp sibling and rename.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on write failure.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Result of one engine invocation.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Terminal status per visited task, in visit order. Tasks aborted by
    /// an upstream failure stay `Pending`.
    pub statuses: Vec<(TaskId, TaskStatus)>,
}

impl ExecutionReport {
    /// The first failed task, when any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&TaskId> {
        self.statuses
            .iter()
            .find(|(_, status)| *status == TaskStatus::Failed)
            .map(|(id, _)| id)
    }

    fn record(&mut self, id: &TaskId, status: TaskStatus) {
        self.statuses.push((id.clone(), status));
    }
}

/// Contributes tasks to the graph; extensions implement this.
pub trait TaskProvider: Send + Sync {
    /// Provider name used in diagnostics.
    fn name(&self) -> &str;
    /// The tasks this provider contributes.
    fn tasks<'a>(&'a self) -> Vec<Task<'a>>;
}

/// The assembled DAG for one engine invocation.
#[derive(Default)]
pub struct TaskGraph<'a> {
    tasks: BTreeMap<TaskId, Task<'a>>,
}

impl<'a> TaskGraph<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; the last registration of an id wins.
    pub fn register(&mut self, task: Task<'a>) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// All registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&TaskId> {
        self.tasks.keys().collect()
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task<'a>> {
        self.tasks.get(id)
    }

    /// Expand a user selector into concrete task ids: `kind:arg` selects
    /// one task, a bare `kind` selects every task of that kind.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when nothing matches.
    pub fn select(&self, selector: &str) -> Result<Vec<TaskId>> {
        let exact = TaskId::parse(selector);
        if self.tasks.contains_key(&exact) {
            return Ok(vec![exact]);
        }
        let matched: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| id.kind() == selector)
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(AltoError::config(
                selector,
                format!("no task matches `{selector}`"),
            ));
        }
        Ok(matched)
    }

    /// Transitive closure of `roots` in topological (dependency-first)
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] on an unknown dependency or a cycle.
    pub fn closure(&self, roots: &[TaskId]) -> Result<Vec<TaskId>> {
        let mut order = Vec::new();
        let mut visiting = BTreeSet::new();
        let mut visited = BTreeSet::new();
        for root in roots {
            self.visit(root, &mut visiting, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: &TaskId,
        visiting: &mut BTreeSet<TaskId>,
        visited: &mut BTreeSet<TaskId>,
        order: &mut Vec<TaskId>,
    ) -> Result<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id.clone()) {
            return Err(AltoError::config(
                id.as_str(),
                "task dependency cycle detected",
            ));
        }
        let task = self.tasks.get(id).ok_or_else(|| {
            AltoError::config(id.as_str(), format!("unknown task `{id}` in dependency graph"))
        })?;
        for dep in &task.deps {
            self.visit(dep, visiting, visited, order)?;
        }
        visiting.remove(id);
        visited.insert(id.clone());
        order.push(id.clone());
        Ok(())
    }

    fn is_fresh(&self, task: &Task<'a>, db: &TaskDb) -> Result<(bool, String)> {
        match &task.freshness {
            Freshness::Always => Ok((false, String::new())),
            Freshness::Probe(probe) => Ok((probe()?, String::new())),
            Freshness::Fingerprint => {
                let fingerprint = task.fingerprint()?;
                let fresh = db
                    .get(&task.id)
                    .is_some_and(|record| {
                        record.status == TaskStatus::Succeeded
                            && record.inputs_fingerprint == fingerprint
                    })
                    && task.outputs_exist();
                Ok((fresh, fingerprint))
            }
        }
    }

    /// Execute the closure of `roots` sequentially.
    ///
    /// A failed task records [`TaskStatus::Failed`], aborts its transitive
    /// dependents, and the report surfaces the first failure; independent
    /// subgraphs still run. On a termination request no further task is
    /// scheduled.
    ///
    /// # Errors
    ///
    /// Returns the first failing task's error after the graph winds down,
    /// or [`AltoError::Config`] on selection/cycle problems.
    pub fn execute(
        &self,
        roots: &[TaskId],
        db: &mut TaskDb,
        shutdown: &Shutdown,
    ) -> Result<ExecutionReport> {
        let order = self.closure(roots)?;
        let mut report = ExecutionReport::default();
        let mut failed: BTreeSet<TaskId> = BTreeSet::new();
        let mut first_error: Option<AltoError> = None;

        for id in &order {
            if shutdown.is_triggered() {
                tracing::warn!("Termination requested, not scheduling further tasks");
                break;
            }
            let task = &self.tasks[id];
            if task.deps.iter().any(|dep| failed.contains(dep)) {
                // Aborted downstream of a failure; stays Pending.
                failed.insert(id.clone());
                report.record(id, TaskStatus::Pending);
                continue;
            }

            let (fresh, fingerprint) = match self.is_fresh(task, db) {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(task = %id, "Freshness check failed: {err}");
                    failed.insert(id.clone());
                    report.record(id, TaskStatus::Failed);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }
            };
            if fresh {
                tracing::info!(task = %id, "Up to date, skipping");
                report.record(id, TaskStatus::Skipped);
                continue;
            }

            tracing::info!(task = %id, doc = task.doc, "Running task");
            match (task.action)() {
                Ok(()) => {
                    let outputs = task
                        .outputs
                        .iter()
                        .map(|p| p.to_string_lossy().into_owned())
                        .collect();
                    // Fingerprint inputs after the run: the action may
                    // produce files the declaration points at.
                    let fingerprint = if fingerprint.is_empty() {
                        task.fingerprint()?
                    } else {
                        fingerprint
                    };
                    db.upsert(TaskRecord::succeeded(id.clone(), fingerprint, outputs));
                    db.save()?;
                    report.record(id, TaskStatus::Succeeded);
                }
                Err(err) => {
                    tracing::error!(task = %id, "Task failed: {err}");
                    db.upsert(TaskRecord::failed(id.clone(), fingerprint));
                    db.save()?;
                    failed.insert(id.clone());
                    report.record(id, TaskStatus::Failed);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Execute the closure of `roots` with independent tasks running on
    /// worker threads, at most `workers` at a time.
    ///
    /// Waves of ready tasks (all dependencies terminal) run concurrently;
    /// the record file is still written only by this coordinating thread,
    /// between waves.
    ///
    /// # Errors
    ///
    /// Same contract as [`TaskGraph::execute`].
    pub fn execute_parallel(
        &self,
        roots: &[TaskId],
        db: &mut TaskDb,
        shutdown: &Shutdown,
        workers: usize,
    ) -> Result<ExecutionReport> {
        let order = self.closure(roots)?;
        let workers = workers.max(1);
        let mut report = ExecutionReport::default();
        let mut failed: BTreeSet<TaskId> = BTreeSet::new();
        let mut done: BTreeSet<TaskId> = BTreeSet::new();
        let mut first_error: Option<AltoError> = None;

        while done.len() + failed.len() < order.len() {
            if shutdown.is_triggered() {
                tracing::warn!("Termination requested, not scheduling further tasks");
                break;
            }
            // Abort dependents of failures first so they never become ready.
            for id in &order {
                if done.contains(id) || failed.contains(id) {
                    continue;
                }
                let task = &self.tasks[id];
                if task.deps.iter().any(|dep| failed.contains(dep)) {
                    failed.insert(id.clone());
                    report.record(id, TaskStatus::Pending);
                }
            }

            let ready: Vec<&TaskId> = order
                .iter()
                .filter(|id| !done.contains(*id) && !failed.contains(*id))
                .filter(|id| {
                    self.tasks[*id]
                        .deps
                        .iter()
                        .all(|dep| done.contains(dep))
                })
                .take(workers)
                .collect();
            if ready.is_empty() {
                break;
            }

            let wave: Vec<(TaskId, Result<(bool, String)>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = ready
                    .iter()
                    .map(|id| {
                        let task = &self.tasks[*id];
                        let fresh = self.is_fresh(task, db);
                        let id = (*id).clone();
                        scope.spawn(move || {
                            let outcome = match fresh {
                                Ok((true, fp)) => Ok((true, fp)),
                                Ok((false, fp)) => (task.action)().map(|()| (false, fp)),
                                Err(err) => Err(err),
                            };
                            (id, outcome)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            (
                                TaskId::parse("<panicked>"),
                                Err(AltoError::config("task", "worker thread panicked")),
                            )
                        })
                    })
                    .collect()
            });

            for (id, outcome) in wave {
                let task = &self.tasks[&id];
                match outcome {
                    Ok((true, _)) => {
                        tracing::info!(task = %id, "Up to date, skipping");
                        report.record(&id, TaskStatus::Skipped);
                        done.insert(id);
                    }
                    Ok((false, fingerprint)) => {
                        let outputs = task
                            .outputs
                            .iter()
                            .map(|p| p.to_string_lossy().into_owned())
                            .collect();
                        let fingerprint = if fingerprint.is_empty() {
                            task.fingerprint()?
                        } else {
                            fingerprint
                        };
                        db.upsert(TaskRecord::succeeded(id.clone(), fingerprint, outputs));
                        report.record(&id, TaskStatus::Succeeded);
                        done.insert(id);
                    }
                    Err(err) => {
                        tracing::error!(task = %id, "Task failed: {err}");
                        db.upsert(TaskRecord::failed(id.clone(), String::new()));
                        report.record(&id, TaskStatus::Failed);
                        failed.insert(id);
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            db.save()?;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Run the clean actions of the selected tasks and forget their
    /// records. Dependencies are not cleaned.
    ///
    /// # Errors
    ///
    /// Returns the first clean action error.
    pub fn clean(&self, roots: &[TaskId], db: &mut TaskDb) -> Result<()> {
        for id in roots {
            let task = self.tasks.get(id).ok_or_else(|| {
                AltoError::config(id.as_str(), format!("unknown task `{id}`"))
            })?;
            if let Some(clean) = &task.clean {
                tracing::info!(task = %id, "Cleaning");
                clean()?;
            }
            db.forget(id);
        }
        db.save()?;
        Ok(())
    }
}
