//! Task discovery: turns the projected configuration into the task DAG.
//!
//! The engine enumerates (plugin, pipeline, extension) tuples and emits
//! task nodes with statically declared edges:
//!
//! ```text
//! <tap>:<target>  <- build:<tap>, build:<target>, config:<tap>,
//!                    config:<target>--<tap>, apply:<tap>
//! apply:<tap>     <- catalog:<tap>, config:<tap>
//! catalog:<tap>   <- build:<tap>, config:<tap>
//! ```
//!
//! A user-selected task triggers topological execution of its closure;
//! staging is torn down when the engine is dropped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use alto_store::StorageBackend;
use alto_types::config::EffectiveConfig;
use alto_types::plugin::{Capability, PluginKind, PluginSpec};
use alto_types::singer::{message_kind, MessageKind};
use alto_types::task::TaskId;
use alto_types::{AltoError, Result};

use crate::artifact::{ArtifactCache, PackagerConfig};
use crate::catalog::{
    clean_base_catalog, discover_base_catalog, fetch_base_catalog, render_runtime_catalog,
};
use crate::fingerprint::BuildTags;
use crate::paths::{reservoir_name, ProjectLayout};
use crate::pipeline::{run_pipeline, PiiHasher, PipelineOptions, ProcessSpec, Shutdown};
use crate::project::Projection;
use crate::reservoir::{
    compact_reservoir, run_reservoir_to_target, run_tap_to_reservoir, DEFAULT_BUFFER_SIZE,
};
use crate::state::StateStore;
use crate::tasks::{ExecutionReport, Freshness, Task, TaskDb, TaskGraph, TaskProvider};

static PIPELINE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_pipeline_id() -> String {
    format!(
        "{}-{:x}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id(),
        PIPELINE_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// The assembled engine for one project and environment.
pub struct AltoEngine {
    config: EffectiveConfig,
    store: Arc<dyn StorageBackend>,
    layout: ProjectLayout,
    packager: PackagerConfig,
    tags: BuildTags,
    shutdown: Shutdown,
    providers: Vec<Box<dyn TaskProvider>>,
}

impl AltoEngine {
    /// Assemble an engine over an already-resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the project layout cannot be created.
    pub fn new(
        root_dir: impl Into<PathBuf>,
        config: EffectiveConfig,
        store: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let layout = ProjectLayout::open(root_dir, &config.env)?;
        let packager = packager_from_config(&config);
        Ok(Self {
            config,
            store,
            layout,
            packager,
            tags: BuildTags::current(),
            shutdown: Shutdown::new(),
            providers: Vec::new(),
        })
    }

    /// The effective configuration the engine was assembled over.
    #[must_use]
    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    /// The termination token; trigger it from a signal handler.
    #[must_use]
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Register an extension task provider.
    pub fn register_provider(&mut self, provider: Box<dyn TaskProvider>) {
        tracing::debug!(provider = provider.name(), "Registered task provider");
        self.providers.push(provider);
    }

    fn projection(&self) -> Projection<'_> {
        Projection::new(&self.config)
    }

    fn artifacts(&self) -> ArtifactCache<'_> {
        ArtifactCache::new(
            &self.layout,
            self.store.as_ref(),
            self.packager.clone(),
            self.tags.clone(),
        )
    }

    fn states(&self) -> StateStore<'_> {
        StateStore::new(self.store.as_ref(), &self.layout)
    }

    fn hash_salt(&self) -> String {
        self.config
            .get_str("hash_salt")
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.config
                    .get_str("project_name")
                    .unwrap_or("alto")
                    .to_string()
            })
    }

    fn buffer_size(&self) -> u64 {
        self.config
            .get("reservoir_buffer_size")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    fn grace(&self) -> Duration {
        let secs = self
            .config
            .get("termination_grace_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        Duration::from_secs(secs)
    }

    /// Fetch-or-upload probe for a built artifact; mirrors the build task's
    /// up-to-dateness: present locally (ensuring the remote copy exists) or
    /// present remotely (copied down on demand).
    fn probe_artifact(&self, spec: &PluginSpec) -> Result<bool> {
        let cache = self.artifacts();
        let fp = cache.fingerprint(spec);
        let local = self.layout.plugin_path(&fp);
        if local.is_file() {
            // get_or_build re-uploads when the remote copy is missing.
            cache.get_or_build(spec)?;
            return Ok(true);
        }
        let remote = ProjectLayout::remote_plugin_key(&fp);
        if self.store.exists(&remote)? {
            cache.get_or_build(spec)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolved executable invocation for a previously built plugin.
    fn invocation(&self, spec: &PluginSpec) -> Result<ProcessSpec> {
        let exe = self.artifacts().get_or_build(spec)?;
        let projection = self.projection();
        Ok(ProcessSpec::new(exe).envs(projection.runtime_env(spec)))
    }

    fn tap_invocation(
        &self,
        tap: &PluginSpec,
        catalog_path: &std::path::Path,
        state_path: Option<&std::path::Path>,
    ) -> Result<ProcessSpec> {
        let config_path = self.layout.config_path(&tap.name, None)?;
        let mut process = self
            .invocation(tap)?
            .arg("--config")
            .arg(config_path.to_string_lossy());
        if tap.supports(Capability::Catalog) {
            process = process
                .arg("--catalog")
                .arg(catalog_path.to_string_lossy());
        } else if tap.supports(Capability::Properties) {
            process = process
                .arg("--properties")
                .arg(catalog_path.to_string_lossy());
        }
        if let Some(state) = state_path {
            if tap.supports(Capability::State) {
                process = process.arg("--state").arg(state.to_string_lossy());
            }
        }
        Ok(process)
    }

    fn stream_map_specs(&self, tap: &PluginSpec) -> Vec<ProcessSpec> {
        tap.stream_maps
            .iter()
            .map(|map| {
                let mut process =
                    ProcessSpec::new(self.layout.root_dir().join(&map.path));
                for arg in &map.args {
                    process = process.arg(arg);
                }
                process
            })
            .collect()
    }

    fn upload_log(&self, local: &std::path::Path, plugin: &str, pipeline_id: &str) {
        if !local.exists() {
            return;
        }
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M").to_string();
        let remote = self
            .layout
            .remote_log_key(&format!("{timestamp}--{plugin}--{pipeline_id}.log"));
        match std::fs::read(local) {
            Ok(bytes) => {
                if let Err(err) = self.store.put(&remote, &bytes) {
                    tracing::warn!(log = %local.display(), "Failed to upload log: {err}");
                } else {
                    let _ = std::fs::remove_file(local);
                    tracing::info!(remote = %remote, "Uploaded pipeline log");
                }
            }
            Err(err) => tracing::warn!(log = %local.display(), "Failed to read log: {err}"),
        }
    }

    // -- pipeline actions --------------------------------------------------

    fn run_tap_target_pipeline(&self, tap: &PluginSpec, target: &PluginSpec) -> Result<()> {
        let pipeline_id = next_pipeline_id();
        let pipeline = format!("{}:{}", tap.name, target.name);
        let projection = self.projection();
        let states = self.states();

        // The apply dependency wrote the runtime catalog; re-deriving here
        // also hands us the PII field set (the render is idempotent).
        let base = fetch_base_catalog(self.store.as_ref(), &self.layout, &tap.name)?
            .ok_or_else(|| AltoError::Discovery {
                tap: tap.name.clone(),
                message: "base catalog missing; run catalog task first".to_string(),
            })?;
        let (catalog_path, selection) = render_runtime_catalog(&self.layout, tap, &base)?;

        let state_doc = states.load_active(&tap.name, &target.name)?;
        let state_path = match &state_doc {
            Some(_) => states.materialize(&tap.name, &target.name)?,
            None => None,
        };

        let tap_process = self.tap_invocation(tap, &catalog_path, state_path.as_deref())?;
        let target_config = projection.render_config(&self.layout, target, Some(tap))?;
        let mut target_process = self
            .invocation(target)?
            .arg("--config")
            .arg(target_config.to_string_lossy());
        // The pair inherits the tap's effective load path.
        if let Some(load_path) = projection.load_path(tap) {
            target_process
                .env
                .insert("ALTO_LOAD_PATH".to_string(), load_path);
        }

        let pii = PiiHasher::new(self.hash_salt(), selection.pii_fields);
        let options = PipelineOptions {
            pipeline_id: pipeline_id.clone(),
            grace: self.grace(),
        };
        let outcome = run_pipeline(
            &self.layout,
            &pipeline,
            &tap_process,
            &self.stream_map_specs(tap),
            &target_process,
            pii,
            state_doc,
            &options,
            &self.shutdown,
        );

        match outcome {
            Ok(outcome) => {
                if let Some(new_state) = outcome.new_state {
                    states.commit(&tap.name, &target.name, &new_state)?;
                }
                self.upload_log(&outcome.tap_log, &tap.name, &pipeline_id);
                self.upload_log(&outcome.target_log, &target.name, &pipeline_id);
                Ok(())
            }
            Err(err) => {
                let tap_log = self.layout.log_path(&format!("tap-{pipeline_id}.log"))?;
                let target_log = self.layout.log_path(&format!("target-{pipeline_id}.log"))?;
                self.upload_log(&tap_log, &tap.name, &pipeline_id);
                self.upload_log(&target_log, &target.name, &pipeline_id);
                Err(err)
            }
        }
    }

    fn run_tap_reservoir_pipeline(&self, tap: &PluginSpec) -> Result<()> {
        let pipeline_id = next_pipeline_id();
        let states = self.states();

        let base = fetch_base_catalog(self.store.as_ref(), &self.layout, &tap.name)?
            .ok_or_else(|| AltoError::Discovery {
                tap: tap.name.clone(),
                message: "base catalog missing; run catalog task first".to_string(),
            })?;
        let (catalog_path, _) = render_runtime_catalog(&self.layout, tap, &base)?;

        let state_doc = states.load_active(&tap.name, "reservoir")?;
        let state_path = match &state_doc {
            Some(_) => states.materialize(&tap.name, "reservoir")?,
            None => None,
        };
        let tap_process = self.tap_invocation(tap, &catalog_path, state_path.as_deref())?;

        let options = PipelineOptions {
            pipeline_id: pipeline_id.clone(),
            grace: self.grace(),
        };
        let result = run_tap_to_reservoir(
            &self.layout,
            self.store.as_ref(),
            &tap.name,
            &tap_process,
            self.buffer_size(),
            state_doc,
            &options,
            &self.shutdown,
        );

        let tap_log = self.layout.log_path(&format!("tap-{pipeline_id}.log"))?;
        self.upload_log(&tap_log, &tap.name, &pipeline_id);

        let outcome = result?;
        if let Some(new_state) = outcome.new_state {
            states.commit(&tap.name, "reservoir", &new_state)?;
        }
        Ok(())
    }

    fn run_reservoir_target_pipeline(&self, tap: &PluginSpec, target: &PluginSpec) -> Result<()> {
        let pipeline_id = next_pipeline_id();
        let projection = self.projection();
        let states = self.states();
        let source = reservoir_name(&tap.name);

        let target_config = projection.render_config(&self.layout, target, Some(tap))?;
        let mut target_process = self
            .invocation(target)?
            .arg("--config")
            .arg(target_config.to_string_lossy());
        if let Some(load_path) = projection.load_path(tap) {
            target_process
                .env
                .insert("ALTO_LOAD_PATH".to_string(), load_path);
        }

        let watermarks = states.load_active(&source, &target.name)?;
        let options = PipelineOptions {
            pipeline_id: pipeline_id.clone(),
            grace: self.grace(),
        };
        let result = run_reservoir_to_target(
            &self.layout,
            self.store.as_ref(),
            &tap.name,
            &target_process,
            target.idempotent,
            watermarks,
            &options,
            &self.shutdown,
        );

        let target_log = self.layout.log_path(&format!("target-{pipeline_id}.log"))?;
        self.upload_log(&target_log, &target.name, &pipeline_id);

        let outcome = result?;
        if outcome.files_replayed > 0 {
            states.commit(&source, &target.name, &outcome.watermarks)?;
        }
        Ok(())
    }

    fn run_tap_test(&self, tap: &PluginSpec) -> Result<()> {
        let base = fetch_base_catalog(self.store.as_ref(), &self.layout, &tap.name)?
            .ok_or_else(|| AltoError::Discovery {
                tap: tap.name.clone(),
                message: "base catalog missing; run catalog task first".to_string(),
            })?;
        let (catalog_path, _) = render_runtime_catalog(&self.layout, tap, &base)?;
        let process = self.tap_invocation(tap, &catalog_path, None)?;

        if tap.supports(Capability::Test) {
            // Taps with a native test mode run to completion.
            let status = process
                .command()
                .arg("--test")
                .stdin(Stdio::null())
                .status()?;
            if !status.success() {
                return Err(AltoError::Pipeline {
                    pipeline: format!("test:{}", tap.name),
                    message: format!("tap self-test exited with {status}"),
                    exit_code: status.code(),
                });
            }
            return Ok(());
        }

        // Otherwise the tap passes as soon as it produces one RECORD.
        let mut child = process
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        use std::io::BufRead;
        let stdout = child.stdout.take().expect("tap stdout is piped");
        let mut reader = std::io::BufReader::new(stdout);
        let mut line = Vec::new();
        let mut passed = false;
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
                    if message_kind(trimmed) == MessageKind::Record {
                        passed = true;
                        break;
                    }
                }
            }
        }
        let _ = child.kill();
        let _ = child.wait();
        if passed {
            tracing::info!(tap = tap.name, "Tap produced a record, test passed");
            Ok(())
        } else {
            Err(AltoError::Pipeline {
                pipeline: format!("test:{}", tap.name),
                message: "tap exited without emitting a RECORD".to_string(),
                exit_code: None,
            })
        }
    }

    // -- graph assembly ----------------------------------------------------

    /// Discover every task the configuration implies.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when a plugin declaration is
    /// malformed.
    #[allow(clippy::too_many_lines)]
    pub fn build_graph(&self) -> Result<TaskGraph<'_>> {
        let projection = self.projection();
        let mut graph = TaskGraph::new();

        let taps = projection.plugins(&[PluginKind::Tap])?;
        let targets = projection.plugins(&[PluginKind::Target])?;
        let all = projection.plugins(&[])?;

        // build:<plugin>
        for spec in &all {
            let id = TaskId::new("build", &spec.name);
            if let Some(parent) = &spec.inherit_from {
                // An inheriting plugin shares its parent's artifact.
                graph.register(
                    Task::new(id, format!("Build the {} plugin", spec.name), || Ok(()))
                        .dep(TaskId::new("build", parent))
                        .freshness(Freshness::Probe(Box::new(|| Ok(true)))),
                );
                continue;
            }
            let spec_for_action = spec.clone();
            let spec_for_probe = spec.clone();
            let spec_for_clean = spec.clone();
            graph.register(
                Task::new(id, format!("Build the {} plugin", spec.name), move || {
                    self.artifacts().get_or_build(&spec_for_action)?;
                    Ok(())
                })
                .freshness(Freshness::Probe(Box::new(move || {
                    self.probe_artifact(&spec_for_probe)
                })))
                .clean_action(move || self.artifacts().remove(&spec_for_clean)),
            );
        }

        // config:<plugin> and config:<target>--<tap>
        for spec in taps.iter().chain(targets.iter()) {
            let spec_for_action = spec.clone();
            graph.register(Task::new(
                TaskId::new("config", &spec.name),
                format!("Render configuration for the {} plugin", spec.name),
                move || {
                    self.projection()
                        .render_config(&self.layout, &spec_for_action, None)?;
                    Ok(())
                },
            ));
        }
        for tap in &taps {
            for target in &targets {
                let tap_for_action = tap.clone();
                let target_for_action = target.clone();
                graph.register(Task::new(
                    TaskId::new("config", format!("{}--{}", target.name, tap.name)),
                    format!(
                        "Render configuration for the {} plugin with {} as source",
                        target.name, tap.name
                    ),
                    move || {
                        self.projection().render_config(
                            &self.layout,
                            &target_for_action,
                            Some(&tap_for_action),
                        )?;
                        Ok(())
                    },
                ));
            }
        }

        // catalog:<tap> and apply:<tap>
        for tap in &taps {
            let tap_for_action = tap.clone();
            let tap_name_probe = tap.name.clone();
            let tap_name_clean = tap.name.clone();
            graph.register(
                Task::new(
                    TaskId::new("catalog", &tap.name),
                    format!(
                        "Generate base catalog for {} (name-keyed cache; `clean catalog:{}` forces rediscovery)",
                        tap.name, tap.name
                    ),
                    move || {
                        let exe = self.artifacts().get_or_build(&tap_for_action)?;
                        let config_path =
                            self.layout.config_path(&tap_for_action.name, None)?;
                        let env = self.projection().runtime_env(&tap_for_action);
                        discover_base_catalog(
                            self.store.as_ref(),
                            &self.layout,
                            &tap_for_action,
                            &exe,
                            &config_path,
                            &env,
                        )?;
                        Ok(())
                    },
                )
                .dep(TaskId::new("build", &tap.name))
                .dep(TaskId::new("config", &tap.name))
                .freshness(Freshness::Probe(Box::new(move || {
                    Ok(fetch_base_catalog(self.store.as_ref(), &self.layout, &tap_name_probe)?
                        .is_some())
                })))
                .clean_action(move || clean_base_catalog(self.store.as_ref(), &tap_name_clean)),
            );

            let tap_for_apply = tap.clone();
            graph.register(
                Task::new(
                    TaskId::new("apply", &tap.name),
                    format!("Render runtime catalog for {}", tap.name),
                    move || {
                        let base = fetch_base_catalog(
                            self.store.as_ref(),
                            &self.layout,
                            &tap_for_apply.name,
                        )?
                        .ok_or_else(|| AltoError::Discovery {
                            tap: tap_for_apply.name.clone(),
                            message: "base catalog missing after catalog task".to_string(),
                        })?;
                        render_runtime_catalog(&self.layout, &tap_for_apply, &base)?;
                        Ok(())
                    },
                )
                .dep(TaskId::new("catalog", &tap.name))
                .dep(TaskId::new("config", &tap.name)),
            );
        }

        // about:<tap> and test:<tap>
        for tap in &taps {
            if tap.supports(Capability::About) {
                let tap_for_about = tap.clone();
                graph.register(
                    Task::new(
                        TaskId::new("about", &tap.name),
                        format!("Run about for {}", tap.name),
                        move || {
                            let config_path =
                                self.layout.config_path(&tap_for_about.name, None)?;
                            let status = self
                                .invocation(&tap_for_about)?
                                .arg("--about")
                                .arg("--config")
                                .arg(config_path.to_string_lossy())
                                .command()
                                .status()?;
                            if status.success() {
                                Ok(())
                            } else {
                                Err(AltoError::Pipeline {
                                    pipeline: format!("about:{}", tap_for_about.name),
                                    message: format!("about exited with {status}"),
                                    exit_code: status.code(),
                                })
                            }
                        },
                    )
                    .dep(TaskId::new("build", &tap.name))
                    .dep(TaskId::new("config", &tap.name)),
                );
            }

            let tap_for_test = tap.clone();
            graph.register(
                Task::new(
                    TaskId::new("test", &tap.name),
                    format!("Test the {} plugin", tap.name),
                    move || self.run_tap_test(&tap_for_test),
                )
                .dep(TaskId::new("build", &tap.name))
                .dep(TaskId::new("apply", &tap.name))
                .dep(TaskId::new("config", &tap.name)),
            );
        }

        // <tap>:<target> pipelines
        for tap in &taps {
            for target in &targets {
                let tap_for_run = tap.clone();
                let target_for_run = target.clone();
                let tap_for_clean = tap.name.clone();
                let target_for_clean = target.name.clone();
                graph.register(
                    Task::new(
                        TaskId::new(&tap.name, &target.name),
                        format!("Run the {} to {} data pipeline", tap.name, target.name),
                        move || self.run_tap_target_pipeline(&tap_for_run, &target_for_run),
                    )
                    .dep(TaskId::new("build", &tap.name))
                    .dep(TaskId::new("build", &target.name))
                    .dep(TaskId::new("config", &tap.name))
                    .dep(TaskId::new("config", format!("{}--{}", target.name, tap.name)))
                    .dep(TaskId::new("apply", &tap.name))
                    .clean_action(move || {
                        self.states().clean(&tap_for_clean, &target_for_clean)
                    }),
                );
            }
        }

        // <tap>:reservoir
        for tap in &taps {
            let tap_for_run = tap.clone();
            let tap_name_clean = tap.name.clone();
            graph.register(
                Task::new(
                    TaskId::new(&tap.name, "reservoir"),
                    format!("Run the {} to reservoir data pipeline", tap.name),
                    move || self.run_tap_reservoir_pipeline(&tap_for_run),
                )
                .dep(TaskId::new("build", &tap.name))
                .dep(TaskId::new("config", &tap.name))
                .dep(TaskId::new("apply", &tap.name))
                .clean_action(move || {
                    let prefix = self.layout.reservoir_prefix(&tap_name_clean);
                    compact_reservoir(self.store.as_ref(), &prefix, "clean")?;
                    Ok(())
                }),
            );
        }

        // reservoir:<tap>-<target>
        for tap in &taps {
            for target in &targets {
                let tap_for_run = tap.clone();
                let target_for_run = target.clone();
                let source_clean = reservoir_name(&tap.name);
                let target_clean = target.name.clone();
                graph.register(
                    Task::new(
                        TaskId::new("reservoir", format!("{}-{}", tap.name, target.name)),
                        format!(
                            "Replay the {} reservoir into the {} target",
                            tap.name, target.name
                        ),
                        move || {
                            self.run_reservoir_target_pipeline(&tap_for_run, &target_for_run)
                        },
                    )
                    .dep(TaskId::new("build", &target.name))
                    .dep(TaskId::new("config", format!("{}--{}", target.name, tap.name)))
                    .clean_action(move || self.states().clean(&source_clean, &target_clean)),
                );
            }
        }

        // Extension-provided tasks.
        for provider in &self.providers {
            for task in provider.tasks() {
                graph.register(task);
            }
        }

        Ok(graph)
    }

    // -- entry points ------------------------------------------------------

    /// Execute the tasks a selector names (plus their closures).
    ///
    /// # Errors
    ///
    /// Propagates the first failing task's error.
    pub fn run(&self, selectors: &[String], parallel: Option<usize>) -> Result<ExecutionReport> {
        let graph = self.build_graph()?;
        let mut roots = Vec::new();
        for selector in selectors {
            roots.extend(graph.select(selector)?);
        }
        let mut db = TaskDb::load(self.layout.record_file())?;
        match parallel {
            Some(workers) => graph.execute_parallel(&roots, &mut db, &self.shutdown, workers),
            None => graph.execute(&roots, &mut db, &self.shutdown),
        }
    }

    /// Run the clean actions of the selected tasks.
    ///
    /// # Errors
    ///
    /// Propagates the first failing clean action.
    pub fn clean(&self, selectors: &[String]) -> Result<()> {
        let graph = self.build_graph()?;
        let mut roots = Vec::new();
        for selector in selectors {
            roots.extend(graph.select(selector)?);
        }
        let mut db = TaskDb::load(self.layout.record_file())?;
        graph.clean(&roots, &mut db)
    }

    /// Tasks the configuration implies, with their doc strings.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] when a declaration is malformed.
    pub fn list_tasks(&self) -> Result<Vec<(TaskId, String)>> {
        let graph = self.build_graph()?;
        Ok(graph
            .ids()
            .into_iter()
            .map(|id| {
                let doc = graph.get(id).map(|t| t.doc.clone()).unwrap_or_default();
                (id.clone(), doc)
            })
            .collect())
    }

    /// Build (if needed) and execute a plugin directly with pass-through
    /// arguments, inheriting the caller's stdio.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Config`] for an unknown plugin or the launch
    /// failure.
    pub fn invoke(&self, plugin: &str, args: &[String]) -> Result<i32> {
        let spec = self.projection().spec(plugin)?;
        let config_path = self
            .projection()
            .render_config(&self.layout, &spec, None)?;
        let process = self.invocation(&spec)?;
        let mut command = Command::new(&process.program);
        command.envs(&process.env);
        command.env("ALTO_CONFIG", config_path);
        command.args(args);
        let status = command.status()?;
        Ok(status.code().unwrap_or(1))
    }
}

fn packager_from_config(config: &EffectiveConfig) -> PackagerConfig {
    let mut packager = PackagerConfig::default();
    if let Some(map) = config.get("packager").and_then(Value::as_object) {
        if let Some(program) = map.get("program").and_then(Value::as_str) {
            packager.program = program.to_string();
        }
        if let Some(args) = map.get("args").and_then(Value::as_array) {
            packager.args = args
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }
    packager
}

/// Map of task kinds to a one-line description, used by the CLI listing.
#[must_use]
pub fn task_kind_docs() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("build", "Generate plugin executables from the configuration"),
        ("config", "Generate configuration files on disk"),
        ("catalog", "Generate base catalog files for Singer taps"),
        ("apply", "Apply user config to base catalog files"),
        ("about", "Run the about command for a Singer tap"),
        ("test", "Run tests for taps"),
        ("reservoir", "Replay archived streams into targets"),
        ("clean", "Run clean actions for tasks"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alto_store::LocalBackend;
    use alto_types::config::resolve_environment;
    use serde_json::json;

    fn engine(dir: &std::path::Path) -> AltoEngine {
        let layered = match json!({
            "default": {
                "project_name": "demo",
                "load_path": "raw",
                "taps": {
                    "tap-x": {
                        "install_url": "pkg-x==1.0",
                        "capabilities": ["state", "catalog"],
                        "select": ["*.*"]
                    },
                    "tap-child": {"inherit_from": "tap-x"}
                },
                "targets": {
                    "target-jsonl": {"install_url": "target-jsonl==0.1.4"}
                }
            }
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let config = resolve_environment(&layered, "default").unwrap();
        let store = Arc::new(LocalBackend::new(dir.join("store")).unwrap());
        AltoEngine::new(dir.join("proj"), config, store).unwrap()
    }

    #[test]
    fn graph_contains_the_expected_task_families() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let graph = engine.build_graph().unwrap();
        let ids: Vec<String> = graph.ids().iter().map(|id| id.as_str().to_string()).collect();

        for expected in [
            "build:tap-x",
            "build:tap-child",
            "build:target-jsonl",
            "config:tap-x",
            "config:target-jsonl",
            "config:target-jsonl--tap-x",
            "catalog:tap-x",
            "apply:tap-x",
            "test:tap-x",
            "tap-x:target-jsonl",
            "tap-x:reservoir",
            "reservoir:tap-x-target-jsonl",
        ] {
            assert!(ids.contains(&expected.to_string()), "missing {expected} in {ids:?}");
        }
        // No `about` task without the capability.
        assert!(!ids.iter().any(|id| id.starts_with("about:")));
    }

    #[test]
    fn pipeline_task_dependencies_match_the_dag_contract() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let graph = engine.build_graph().unwrap();
        let order = graph
            .closure(&[TaskId::parse("tap-x:target-jsonl")])
            .unwrap();
        let names: Vec<&str> = order.iter().map(TaskId::as_str).collect();
        let pos = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .unwrap_or_else(|| panic!("{name} missing from {names:?}"))
        };
        assert!(pos("build:tap-x") < pos("catalog:tap-x"));
        assert!(pos("catalog:tap-x") < pos("apply:tap-x"));
        assert!(pos("apply:tap-x") < pos("tap-x:target-jsonl"));
        assert!(pos("build:target-jsonl") < pos("tap-x:target-jsonl"));
        assert!(pos("config:target-jsonl--tap-x") < pos("tap-x:target-jsonl"));
    }

    #[test]
    fn selectors_expand_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let graph = engine.build_graph().unwrap();
        // Every pipeline for a tap shares the tap's name as its kind.
        let selected = graph.select("tap-x").unwrap();
        let names: Vec<&str> = selected.iter().map(TaskId::as_str).collect();
        assert!(names.contains(&"tap-x:target-jsonl"));
        assert!(names.contains(&"tap-x:reservoir"));

        assert_eq!(graph.select("build").unwrap().len(), 3);
    }

    #[test]
    fn extension_providers_contribute_tasks() {
        struct Extension;
        impl TaskProvider for Extension {
            fn name(&self) -> &str {
                "docs"
            }
            fn tasks<'a>(&'a self) -> Vec<Task<'a>> {
                vec![Task::new(
                    TaskId::parse("docs:build"),
                    "Render documentation",
                    || Ok(()),
                )]
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.register_provider(Box::new(Extension));
        let graph = engine.build_graph().unwrap();
        assert!(graph.get(&TaskId::parse("docs:build")).is_some());
    }

    #[test]
    fn packager_config_comes_from_the_tree() {
        let layered = match json!({
            "default": {
                "project_name": "demo",
                "packager": {"program": "shiv", "args": ["--compressed"]}
            }
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let config = resolve_environment(&layered, "default").unwrap();
        let packager = packager_from_config(&config);
        assert_eq!(packager.program, "shiv");
        assert_eq!(packager.args, vec!["--compressed"]);
    }
}
