//! The Singer pipeline runner.
//!
//! Spawns the tap and the target as OS processes and stream-copies the
//! tap's stdout into the target's stdin through an in-process transformer
//! that hashes PII-marked fields and chains optional stream-map filters.
//! The target's stdout is scanned for STATE messages; everything else
//! passes through byte-identical, so message order is preserved end-to-end
//! and back-pressure comes from the OS pipe buffers.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use alto_types::singer::{message_kind, parse_state_line, MessageKind, RecordMessage};
use alto_types::{AltoError, Result};

use crate::paths::ProjectLayout;
use crate::state::StateFold;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A fully resolved process invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(&self.env);
        command
    }
}

/// Salted field hasher for PII-marked columns.
///
/// The digest is stable within a project (same salt, same input, same
/// output) so hashed values stay joinable across streams and runs.
#[derive(Debug, Clone, Default)]
pub struct PiiHasher {
    salt: String,
    fields: BTreeMap<String, BTreeSet<String>>,
}

impl PiiHasher {
    #[must_use]
    pub fn new(salt: impl Into<String>, fields: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            salt: salt.into(),
            fields,
        }
    }

    /// Whether any stream has hash-marked fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 64-hex digest of one field value.
    #[must_use]
    pub fn digest(&self, value: &Value) -> String {
        let raw = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(raw.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Rewrite a RECORD line when its stream carries hash-marked fields.
    ///
    /// Returns `None` for lines that pass through untouched: non-RECORD
    /// messages, streams without marked fields, and unparsable lines.
    #[must_use]
    pub fn transform_line(&self, line: &[u8]) -> Option<Vec<u8>> {
        if self.is_empty() || message_kind(line) != MessageKind::Record {
            return None;
        }
        let mut record = RecordMessage::parse(line)?;
        let marked = self.fields.get(&record.stream)?;
        let payload = record.record_mut()?;
        let mut touched = false;
        for field in marked {
            if let Some(value) = payload.get(field) {
                if !value.is_null() {
                    let digest = self.digest(value);
                    payload.insert(field.clone(), Value::String(digest));
                    touched = true;
                }
            }
        }
        if !touched {
            return None;
        }
        record.to_line().ok()
    }
}

/// Cooperative termination token shared between the coordinator and the
/// runner's wait loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination; the runner signals the tap first, then the
    /// target after the grace window.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a pipeline run leaves behind.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Folded STATE document, when the target emitted any.
    pub new_state: Option<Value>,
    /// Per-process stderr log files.
    pub tap_log: PathBuf,
    pub target_log: PathBuf,
}

/// Options beyond the process specs themselves.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Identifier used in log file names.
    pub pipeline_id: String,
    /// How long the target gets to flush after the tap is terminated.
    pub grace: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pipeline_id: format!("{:08x}", std::process::id()),
            grace: Duration::from_secs(10),
        }
    }
}

fn spawn(
    spec: &ProcessSpec,
    pipeline: &str,
    role: &str,
    stdin: Stdio,
    stdout: Stdio,
) -> Result<Child> {
    spec.command()
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AltoError::Pipeline {
            pipeline: pipeline.to_string(),
            message: format!("failed to launch {role} `{}`: {err}", spec.program.display()),
            exit_code: None,
        })
}

/// Pump a child's stderr into a log file.
fn log_pump(stream: impl Read + Send + 'static, path: PathBuf) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let Ok(mut file) = std::fs::File::create(&path) else {
            return;
        };
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = file.write_all(&line);
                }
            }
        }
    })
}

/// Copy tap output to the first downstream stdin, rewriting PII fields.
fn transform_pump(
    stream: impl Read + Send + 'static,
    mut sink: ChildStdin,
    hasher: PiiHasher,
) -> std::thread::JoinHandle<u64> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let mut forwarded = 0u64;
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
                    let write_result = match hasher.transform_line(trimmed) {
                        Some(rewritten) => sink
                            .write_all(&rewritten)
                            .and_then(|()| sink.write_all(b"\n")),
                        None => {
                            if line.ends_with(b"\n") {
                                sink.write_all(&line)
                            } else {
                                sink.write_all(&line).and_then(|()| sink.write_all(b"\n"))
                            }
                        }
                    };
                    if write_result.is_err() {
                        // Downstream died; its exit status tells the story.
                        break;
                    }
                    forwarded += 1;
                }
                Err(_) => break,
            }
        }
        forwarded
        // Dropping the sink closes the pipe and cascades EOF downstream.
    })
}

/// Plain byte copy between two pipeline stages.
fn copy_pump(
    stream: impl Read + Send + 'static,
    mut sink: ChildStdin,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let _ = std::io::copy(&mut reader, &mut sink);
    })
}

/// Scan target stdout for STATE lines, folding them and mirroring the raw
/// output into a log file.
fn intercept_pump(
    stream: impl Read + Send + 'static,
    fold_base: Option<Value>,
    log_path: PathBuf,
) -> std::thread::JoinHandle<StateFold> {
    std::thread::spawn(move || {
        let mut fold = match fold_base {
            Some(base) => StateFold::with_base(base),
            None => StateFold::default(),
        };
        let mut reader = BufReader::new(stream);
        let mut file = std::fs::File::create(&log_path).ok();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Some(file) = file.as_mut() {
                        let _ = file.write_all(&line);
                    }
                    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
                    if message_kind(trimmed) == MessageKind::State {
                        if let Some(message) = parse_state_line(trimmed) {
                            fold.observe(message);
                        }
                    }
                }
            }
        }
        fold
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Tap,
    StreamMap(usize),
    Target,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tap => f.write_str("tap"),
            Self::StreamMap(i) => write!(f, "stream-map {i}"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Run a tap-to-target pipeline to completion.
///
/// Message order is preserved: a single pipe chain connects the stages and
/// nothing is reordered in between. On any non-zero exit the whole
/// pipeline fails with that stage's exit code and the folded state is
/// discarded, so the caller never commits state for a failed run.
///
/// # Errors
///
/// Returns [`AltoError::Pipeline`] when a stage cannot be launched, exits
/// non-zero, or the run is cancelled.
#[allow(clippy::too_many_lines)]
pub fn run_pipeline(
    layout: &ProjectLayout,
    pipeline: &str,
    tap: &ProcessSpec,
    stream_maps: &[ProcessSpec],
    target: &ProcessSpec,
    pii: PiiHasher,
    state_base: Option<Value>,
    options: &PipelineOptions,
    shutdown: &Shutdown,
) -> Result<PipelineOutcome> {
    let id = &options.pipeline_id;
    let tap_log = layout.log_path(&format!("tap-{id}.log"))?;
    let target_log = layout.log_path(&format!("target-{id}.log"))?;
    let state_log = layout.log_path(&format!("state-{id}.log"))?;

    tracing::info!(pipeline, id, "Starting pipeline");

    let mut children: Vec<(Stage, Child)> = Vec::with_capacity(stream_maps.len() + 2);

    let mut tap_child = spawn(tap, pipeline, "tap", Stdio::null(), Stdio::piped())?;
    let tap_stdout = tap_child.stdout.take().expect("tap stdout is piped");
    let tap_stderr = tap_child.stderr.take().expect("tap stderr is piped");
    children.push((Stage::Tap, tap_child));

    let mut map_handles = Vec::new();
    for (index, map_spec) in stream_maps.iter().enumerate() {
        let mut child = spawn(
            map_spec,
            pipeline,
            "stream map",
            Stdio::piped(),
            Stdio::piped(),
        )?;
        let stdin = child.stdin.take().expect("stream map stdin is piped");
        let stdout = child.stdout.take().expect("stream map stdout is piped");
        let stderr = child.stderr.take().expect("stream map stderr is piped");
        map_handles.push((stdin, stdout));
        let map_log = layout.log_path(&format!("map-{index}-{id}.log"))?;
        log_pump(stderr, map_log);
        children.push((Stage::StreamMap(index), child));
    }

    let mut target_child = spawn(target, pipeline, "target", Stdio::piped(), Stdio::piped())?;
    let target_stdin = target_child.stdin.take().expect("target stdin is piped");
    let target_stdout = target_child.stdout.take().expect("target stdout is piped");
    let target_stderr = target_child.stderr.take().expect("target stderr is piped");
    children.push((Stage::Target, target_child));

    // Wire the chain back to front: the last map feeds the target, the
    // transformer feeds the first map (or the target directly).
    let mut downstream_sink = target_stdin;
    let mut pumps = Vec::new();
    for (stdin, stdout) in map_handles.into_iter().rev() {
        pumps.push(copy_pump(stdout, downstream_sink));
        downstream_sink = stdin;
    }
    let transformer = transform_pump(tap_stdout, downstream_sink, pii);
    let tap_logger = log_pump(tap_stderr, tap_log.clone());
    let target_logger = log_pump(target_stderr, target_log.clone());
    let interceptor = intercept_pump(target_stdout, state_base, state_log);

    // Wait loop with cooperative cancellation: signal the tap first, give
    // the target the grace window to flush its final STATE, then stop
    // everything that is left.
    let mut statuses: Vec<Option<std::process::ExitStatus>> = vec![None; children.len()];
    let mut termination_started: Option<Instant> = None;
    loop {
        let mut remaining = 0;
        for (slot, (_, child)) in statuses.iter_mut().zip(children.iter_mut()) {
            if slot.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => *slot = Some(status),
                    Ok(None) => remaining += 1,
                    Err(_) => remaining += 1,
                }
            }
        }
        if remaining == 0 {
            break;
        }
        if shutdown.is_triggered() {
            match termination_started {
                None => {
                    tracing::warn!(pipeline, "Termination requested, stopping tap");
                    if statuses[0].is_none() {
                        let _ = children[0].1.kill();
                    }
                    termination_started = Some(Instant::now());
                }
                Some(started) if started.elapsed() >= options.grace => {
                    tracing::warn!(pipeline, "Grace window elapsed, stopping remaining stages");
                    for (slot, (_, child)) in statuses.iter_mut().zip(children.iter_mut()) {
                        if slot.is_none() {
                            let _ = child.kill();
                        }
                    }
                }
                Some(_) => {}
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let forwarded = transformer.join().unwrap_or_default();
    for pump in pumps {
        let _ = pump.join();
    }
    let _ = tap_logger.join();
    let _ = target_logger.join();
    let fold = interceptor.join().map_err(|_| AltoError::Pipeline {
        pipeline: pipeline.to_string(),
        message: "state interceptor panicked".to_string(),
        exit_code: None,
    })?;

    if shutdown.is_triggered() {
        return Err(AltoError::Pipeline {
            pipeline: pipeline.to_string(),
            message: "terminated by signal".to_string(),
            exit_code: None,
        });
    }

    for ((stage, _), status) in children.iter().zip(&statuses) {
        let status = status.expect("wait loop exited only once all statuses were collected");
        if !status.success() {
            return Err(AltoError::Pipeline {
                pipeline: pipeline.to_string(),
                message: format!("{stage} exited with {status}"),
                exit_code: status.code(),
            });
        }
    }

    tracing::info!(pipeline, messages = forwarded, "Pipeline completed");
    Ok(PipelineOutcome {
        new_state: fold.finish(),
        tap_log,
        target_log,
    })
}
