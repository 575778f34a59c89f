//! The reservoir: a content-addressed, stream-partitioned archive of
//! Singer messages that decouples extraction from loading.
//!
//! Ingest groups incoming messages by `(stream, schema fingerprint)` and
//! writes gzip partitions under
//! `reservoir/<env>/<tap>/<stream>/<schema_fp>/<timestamp>.singer.gz`,
//! each beginning with its SCHEMA line so every partition replays
//! standalone. A schema change opens a new partition directory; prior data
//! stays replayable under its old schema. The only mutations are appending
//! partitions and atomically replacing `_reservoir.json`.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use alto_store::{with_retries, StorageBackend, DEFAULT_MAX_ATTEMPTS};
use alto_types::singer::{
    message_kind, parse_state_line, schema_of, stream_of, MessageKind,
};
use alto_types::{AltoError, Result};

use crate::paths::ProjectLayout;
use crate::pipeline::{PipelineOptions, ProcessSpec, Shutdown};
use crate::state::StateFold;

/// Records buffered per partition before an intermediate flush.
pub const DEFAULT_BUFFER_SIZE: u64 = 10_000;
/// Partitions below this size are eligible for compaction.
const COMPACTION_THRESHOLD_BYTES: u64 = 25_000_000;

const INDEX_FILE: &str = "_reservoir.json";
const LOCK_FILE: &str = "_reservoir.lock";

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// One immutable partition registered in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Full storage key of the partition file.
    pub key: String,
    /// Records in the partition (0 when rebuilt from a listing).
    pub count: u64,
    /// RFC 3339 write time (empty when rebuilt from a listing).
    pub written_at: String,
}

impl PartitionEntry {
    /// The partition file name, which sorts by write time.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// The schema fingerprint segment of the key.
    #[must_use]
    pub fn schema_fp(&self) -> &str {
        let mut segments = self.key.rsplit('/');
        segments.next();
        segments.next().unwrap_or_default()
    }
}

/// `_reservoir.json`: stream name to partition entries, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservoirIndex {
    #[serde(default, rename = "__version__")]
    pub version: u64,
    #[serde(default)]
    pub streams: BTreeMap<String, Vec<PartitionEntry>>,
}

impl ReservoirIndex {
    fn index_key(prefix: &str) -> String {
        format!("{prefix}/{INDEX_FILE}")
    }

    /// Load the index, or rebuild it from a listing when the index object
    /// is missing (partitions are the source of truth).
    ///
    /// # Errors
    ///
    /// Returns a storage error on retrieval failure.
    pub fn load_or_rebuild(store: &dyn StorageBackend, prefix: &str) -> Result<Self> {
        let key = Self::index_key(prefix);
        let exists = with_retries("reservoir.exists", DEFAULT_MAX_ATTEMPTS, || {
            store.exists(&key)
        })?;
        if exists {
            let bytes = with_retries("reservoir.get", DEFAULT_MAX_ATTEMPTS, || store.get(&key))?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        tracing::info!(prefix, "Reservoir index missing, rebuilding from listing");
        let mut index = Self::default();
        for object in store.list(prefix)? {
            if !object.ends_with(".singer.gz") {
                continue;
            }
            // <prefix>/<stream>/<schema_fp>/<file>
            let Some(relative) = object.strip_prefix(prefix).map(|r| r.trim_start_matches('/'))
            else {
                continue;
            };
            let mut segments = relative.split('/');
            let Some(stream) = segments.next() else { continue };
            index
                .streams
                .entry(stream.to_string())
                .or_default()
                .push(PartitionEntry {
                    key: object,
                    count: 0,
                    written_at: String::new(),
                });
        }
        for entries in index.streams.values_mut() {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(index)
    }

    /// Atomically replace the stored index.
    ///
    /// # Errors
    ///
    /// Returns a storage error on write failure.
    pub fn save(&self, store: &dyn StorageBackend, prefix: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        with_retries("reservoir.put_index", DEFAULT_MAX_ATTEMPTS, || {
            store.put_atomic(&Self::index_key(prefix), &bytes)
        })?;
        Ok(())
    }

    /// Total partition count across streams.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }
}

/// 15-hex fingerprint of a stream's schema; the partition directory name.
#[must_use]
pub fn schema_fingerprint(stream: &str, schema: &Value) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are sorted, so this serialization is canonical.
    hasher.update(schema.to_string().as_bytes());
    let mut fp = hex::encode(hasher.finalize());
    fp.truncate(15);
    fp
}

// ---------------------------------------------------------------------------
// Ingest lock
// ---------------------------------------------------------------------------

/// Storage-level lock guarding a tap's reservoir against concurrent
/// ingest runs. Released on drop.
pub struct IngestLock<'a> {
    store: &'a dyn StorageBackend,
    key: String,
}

impl<'a> std::fmt::Debug for IngestLock<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestLock").field("key", &self.key).finish()
    }
}

impl<'a> IngestLock<'a> {
    /// Acquire the lock, failing fast when another run holds it.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Pipeline`] when the lock is already held.
    pub fn acquire(store: &'a dyn StorageBackend, prefix: &str, owner: &str) -> Result<Self> {
        let key = format!("{prefix}/{LOCK_FILE}");
        if store.exists(&key)? {
            let holder = store.get(&key).unwrap_or_default();
            return Err(AltoError::Pipeline {
                pipeline: prefix.to_string(),
                message: format!(
                    "reservoir is locked by run `{}`; remove {key} if it is stale",
                    String::from_utf8_lossy(&holder)
                ),
                exit_code: None,
            });
        }
        store.put(&key, owner.as_bytes())?;
        Ok(Self { store, key })
    }
}

impl Drop for IngestLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.remove(&self.key) {
            tracing::warn!(key = %self.key, "Failed to release reservoir lock: {err}");
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

struct PartitionBuffer {
    header: Vec<u8>,
    encoder: GzEncoder<Vec<u8>>,
    count: u64,
}

impl PartitionBuffer {
    fn new(header: Vec<u8>) -> std::io::Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&header)?;
        Ok(Self {
            header,
            encoder,
            count: 0,
        })
    }
}

/// Groups tap output into gzip partitions; the target half of a
/// `tap -> reservoir` pipeline.
pub struct ReservoirWriter<'a> {
    store: &'a dyn StorageBackend,
    prefix: String,
    buffer_size: u64,
    index: ReservoirIndex,
    buffers: BTreeMap<(String, String), PartitionBuffer>,
    active_schema: BTreeMap<String, String>,
    fold: StateFold,
    partitions_written: u64,
}

impl<'a> ReservoirWriter<'a> {
    /// Open a writer over `prefix`, loading the existing index.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the index cannot be loaded.
    pub fn open(
        store: &'a dyn StorageBackend,
        prefix: String,
        buffer_size: u64,
        state_base: Option<Value>,
    ) -> Result<Self> {
        let index = ReservoirIndex::load_or_rebuild(store, &prefix)?;
        let fold = match state_base {
            Some(base) => StateFold::with_base(base),
            None => StateFold::default(),
        };
        Ok(Self {
            store,
            prefix,
            buffer_size,
            index,
            buffers: BTreeMap::new(),
            active_schema: BTreeMap::new(),
            fold,
            partitions_written: 0,
        })
    }

    /// Consume one tap output line.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Pipeline`] on a RECORD that precedes its
    /// SCHEMA, or a storage error on a flush.
    pub fn observe_line(&mut self, line: &[u8]) -> Result<()> {
        match message_kind(line) {
            MessageKind::State => {
                if let Some(message) = parse_state_line(line) {
                    self.fold.observe(message);
                }
            }
            MessageKind::Schema => {
                let (Some(stream), Some(schema)) = (stream_of(line), schema_of(line)) else {
                    return Ok(());
                };
                let fp = schema_fingerprint(&stream, &schema);
                let slot = (stream.clone(), fp.clone());
                if !self.buffers.contains_key(&slot) {
                    tracing::info!(stream, schema_fp = %fp, "New reservoir partition group");
                    let mut header = line.to_vec();
                    header.push(b'\n');
                    self.buffers.insert(slot, PartitionBuffer::new(header)?);
                }
                self.active_schema.insert(stream, fp);
            }
            MessageKind::Record | MessageKind::Other => {
                let Some(stream) = stream_of(line) else {
                    return Ok(());
                };
                let Some(fp) = self.active_schema.get(&stream).cloned() else {
                    return Err(AltoError::Pipeline {
                        pipeline: self.prefix.clone(),
                        message: format!("RECORD for stream `{stream}` before its SCHEMA"),
                        exit_code: None,
                    });
                };
                let slot = (stream.clone(), fp.clone());
                let buffer = self
                    .buffers
                    .get_mut(&slot)
                    .expect("active schema implies an open buffer");
                buffer.encoder.write_all(line)?;
                buffer.encoder.write_all(b"\n")?;
                buffer.count += 1;
                if buffer.count >= self.buffer_size {
                    self.flush_partition(&stream, &fp)?;
                }
            }
            MessageKind::NotJson => {}
        }
        Ok(())
    }

    fn flush_partition(&mut self, stream: &str, fp: &str) -> Result<()> {
        let slot = (stream.to_string(), fp.to_string());
        let Some(buffer) = self.buffers.remove(&slot) else {
            return Ok(());
        };
        if buffer.count == 0 {
            self.buffers.insert(slot, buffer);
            return Ok(());
        }
        let header = buffer.header.clone();
        let count = buffer.count;
        let bytes = buffer.encoder.finish()?;
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
        let key = format!("{}/{stream}/{fp}/{timestamp}.singer.gz", self.prefix);
        tracing::info!(stream, schema_fp = %fp, records = count, key = %key, "Flushing reservoir partition");
        with_retries("reservoir.put", DEFAULT_MAX_ATTEMPTS, || {
            self.store.put(&key, &bytes)
        })?;
        self.index
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(PartitionEntry {
                key,
                count,
                written_at: chrono::Utc::now().to_rfc3339(),
            });
        self.partitions_written += 1;
        self.buffers.insert(slot, PartitionBuffer::new(header)?);
        Ok(())
    }

    /// Flush every open buffer and atomically publish the updated index.
    ///
    /// Called on both success and failure paths: partitions already
    /// uploaded must be registered either way.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a flush or the index write fails.
    pub fn finalize(mut self) -> Result<(u64, Option<Value>)> {
        let slots: Vec<(String, String)> = self.buffers.keys().cloned().collect();
        for (stream, fp) in slots {
            self.flush_partition(&stream, &fp)?;
        }
        self.index.save(self.store, &self.prefix)?;
        Ok((self.partitions_written, self.fold.finish()))
    }
}

/// Outcome of a `tap -> reservoir` run.
#[derive(Debug)]
pub struct IngestOutcome {
    pub partitions_written: u64,
    pub new_state: Option<Value>,
}

/// Run a tap into the reservoir.
///
/// # Errors
///
/// Returns [`AltoError::Pipeline`] when the tap fails or the reservoir is
/// locked; partitions flushed before a failure stay registered.
pub fn run_tap_to_reservoir(
    layout: &ProjectLayout,
    store: &dyn StorageBackend,
    tap_name: &str,
    tap: &ProcessSpec,
    buffer_size: u64,
    state_base: Option<Value>,
    options: &PipelineOptions,
    shutdown: &Shutdown,
) -> Result<IngestOutcome> {
    let prefix = layout.reservoir_prefix(tap_name);
    let _lock = IngestLock::acquire(store, &prefix, &options.pipeline_id)?;
    let mut writer = ReservoirWriter::open(store, prefix.clone(), buffer_size, state_base)?;

    let pipeline = format!("{tap_name}:reservoir");
    tracing::info!(pipeline, id = options.pipeline_id, "Starting reservoir ingest");
    let mut child = tap
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AltoError::Pipeline {
            pipeline: pipeline.clone(),
            message: format!("failed to launch tap: {err}"),
            exit_code: None,
        })?;

    let stderr = child.stderr.take().expect("tap stderr is piped");
    let log_path = layout.log_path(&format!("tap-{}.log", options.pipeline_id))?;
    let logger = std::thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        if let Ok(mut file) = std::fs::File::create(&log_path) {
            let _ = std::io::copy(&mut reader, &mut file);
        }
    });

    let stdout = child.stdout.take().expect("tap stdout is piped");
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    let mut ingest_error: Option<AltoError> = None;
    loop {
        if shutdown.is_triggered() {
            let _ = child.kill();
            ingest_error = Some(AltoError::Pipeline {
                pipeline: pipeline.clone(),
                message: "terminated by signal".to_string(),
                exit_code: None,
            });
            break;
        }
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
                if let Err(err) = writer.observe_line(trimmed) {
                    let _ = child.kill();
                    ingest_error = Some(err);
                    break;
                }
            }
            Err(err) => {
                ingest_error = Some(err.into());
                break;
            }
        }
    }

    let status = child.wait().map_err(AltoError::Io);
    let _ = logger.join();

    // The index must register partitions that were already uploaded,
    // whatever happened afterwards.
    let (partitions_written, new_state) = writer.finalize()?;

    if let Some(err) = ingest_error {
        return Err(err);
    }
    let status = status?;
    if !status.success() {
        return Err(AltoError::Pipeline {
            pipeline,
            message: format!("tap exited with {status}"),
            exit_code: status.code(),
        });
    }

    tracing::info!(pipeline, partitions_written, "Reservoir ingest completed");
    Ok(IngestOutcome {
        partitions_written,
        new_state,
    })
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Outcome of a `reservoir -> target` run.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Updated per-stream watermark document; the caller persists it as
    /// the state of the `(reservoir, target)` pair.
    pub watermarks: Value,
    pub files_replayed: u64,
}

fn watermark_of(watermarks: &Value, stream: &str) -> String {
    watermarks
        .get(stream)
        .and_then(|s| s.get("emitted"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn set_watermark(watermarks: &mut Value, stream: &str, emitted: &str) {
    if let Some(map) = watermarks.as_object_mut() {
        map.insert(
            stream.to_string(),
            serde_json::json!({ "emitted": emitted }),
        );
    }
}

/// Fast-forward watermarks after the index version moved (a compaction
/// renames partitions, so file-name comparisons restart from the listing).
fn sync_watermarks(watermarks: &mut Value, index: &ReservoirIndex) {
    let version = watermarks
        .get("__version__")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if version == index.version {
        return;
    }
    tracing::info!(
        from = version,
        to = index.version,
        "Reservoir index version moved, re-deriving watermarks"
    );
    for (stream, entries) in &index.streams {
        if watermarks.get(stream).is_none() {
            continue;
        }
        let newest = entries
            .iter()
            .map(PartitionEntry::file_name)
            .max()
            .unwrap_or("");
        let current = watermark_of(watermarks, stream);
        if newest > current.as_str() {
            set_watermark(watermarks, stream, newest);
        }
    }
    if let Some(map) = watermarks.as_object_mut() {
        map.insert("__version__".to_string(), Value::from(index.version));
    }
}

fn emit_partition(
    store: &dyn StorageBackend,
    entry: &PartitionEntry,
    sink: &Mutex<Option<std::process::ChildStdin>>,
) -> Result<()> {
    let compressed = with_retries("reservoir.get", DEFAULT_MAX_ATTEMPTS, || {
        store.get(&entry.key)
    })?;
    let mut decoder = MultiGzDecoder::new(compressed.as_slice());
    let mut payload = Vec::new();
    decoder.read_to_end(&mut payload)?;
    if !payload.ends_with(b"\n") {
        payload.push(b'\n');
    }
    let mut guard = sink.lock().map_err(|_| AltoError::Pipeline {
        pipeline: entry.key.clone(),
        message: "replay sink lock poisoned".to_string(),
        exit_code: None,
    })?;
    if let Some(stdin) = guard.as_mut() {
        stdin.write_all(&payload)?;
    }
    Ok(())
}

/// Replay a tap's reservoir into a target, newest-unseen partitions only.
///
/// Partitions replay in write order per stream. Groups that share a
/// schema fingerprint may replay in parallel when the target is declared
/// idempotent; order across groups is then only file-at-a-time.
///
/// # Errors
///
/// Returns [`AltoError::Pipeline`] when the target fails or the run is
/// cancelled; the watermark document only advances past groups that were
/// fully written to the target.
#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
pub fn run_reservoir_to_target(
    layout: &ProjectLayout,
    store: &dyn StorageBackend,
    tap_name: &str,
    target: &ProcessSpec,
    parallel: bool,
    watermark_base: Option<Value>,
    options: &PipelineOptions,
    shutdown: &Shutdown,
) -> Result<ReplayOutcome> {
    let prefix = layout.reservoir_prefix(tap_name);
    let index = ReservoirIndex::load_or_rebuild(store, &prefix)?;
    if !store.exists(&ReservoirIndex::index_key(&prefix))? {
        index.save(store, &prefix)?;
    }

    let mut watermarks = watermark_base.unwrap_or_else(|| serde_json::json!({}));
    sync_watermarks(&mut watermarks, &index);

    let pipeline = format!("reservoir:{tap_name}");
    tracing::info!(pipeline, id = options.pipeline_id, parallel, "Starting reservoir replay");

    let mut child = target
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AltoError::Pipeline {
            pipeline: pipeline.clone(),
            message: format!("failed to launch target: {err}"),
            exit_code: None,
        })?;

    let stderr = child.stderr.take().expect("target stderr is piped");
    let stdout = child.stdout.take().expect("target stdout is piped");
    let stderr_log = layout.log_path(&format!("target-{}.log", options.pipeline_id))?;
    let stdout_log = layout.log_path(&format!("state-{}.log", options.pipeline_id))?;
    let stderr_logger = std::thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        if let Ok(mut file) = std::fs::File::create(&stderr_log) {
            let _ = std::io::copy(&mut reader, &mut file);
        }
    });
    let stdout_logger = std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        if let Ok(mut file) = std::fs::File::create(&stdout_log) {
            let _ = std::io::copy(&mut reader, &mut file);
        }
    });

    let sink = Mutex::new(child.stdin.take());
    let mut files_replayed = 0u64;
    let mut replay_error: Option<AltoError> = None;

    'streams: for (stream, entries) in &index.streams {
        let watermark = watermark_of(&watermarks, stream);
        let pending: Vec<&PartitionEntry> = entries
            .iter()
            .filter(|entry| entry.file_name() > watermark.as_str())
            .collect();
        if pending.is_empty() {
            continue;
        }
        // Group by schema fingerprint, preserving write order.
        let mut groups: Vec<(String, Vec<&PartitionEntry>)> = Vec::new();
        for entry in pending {
            let fp = entry.schema_fp().to_string();
            match groups.last_mut() {
                Some((last_fp, group)) if *last_fp == fp => group.push(entry),
                _ => groups.push((fp, vec![entry])),
            }
        }
        for (fp, group) in groups {
            if shutdown.is_triggered() {
                replay_error = Some(AltoError::Pipeline {
                    pipeline: pipeline.clone(),
                    message: "terminated by signal".to_string(),
                    exit_code: None,
                });
                break 'streams;
            }
            tracing::info!(
                stream,
                schema_fp = %fp,
                partitions = group.len(),
                "Replaying partition group"
            );
            let group_result: Result<()> = if parallel && group.len() > 1 {
                let sink_ref = &sink;
                std::thread::scope(|scope| {
                    let handles: Vec<_> = group
                        .iter()
                        .map(|entry| {
                            let entry: &PartitionEntry = entry;
                            scope.spawn(move || emit_partition(store, entry, sink_ref))
                        })
                        .collect();
                    let mut first_error = None;
                    for handle in handles {
                        match handle.join() {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) if first_error.is_none() => first_error = Some(err),
                            Ok(Err(_)) => {}
                            Err(_) => {
                                first_error.get_or_insert_with(|| AltoError::Pipeline {
                                    pipeline: pipeline.clone(),
                                    message: "replay worker panicked".to_string(),
                                    exit_code: None,
                                });
                            }
                        }
                    }
                    first_error.map_or(Ok(()), Err)
                })
            } else {
                group.iter().try_for_each(|entry| emit_partition(store, entry, &sink))
            };
            if let Err(err) = group_result {
                replay_error = Some(err);
                break 'streams;
            }
            let newest = group
                .iter()
                .map(|entry| entry.file_name())
                .max()
                .unwrap_or_default();
            let current = watermark_of(&watermarks, stream);
            if newest > current.as_str() {
                set_watermark(&mut watermarks, stream, newest);
            }
            files_replayed += u64::try_from(group.len()).unwrap_or(u64::MAX);
        }
    }

    // Close stdin so the target sees EOF and finishes.
    drop(sink.lock().map(|mut guard| guard.take()));

    let status = if replay_error.is_some() || shutdown.is_triggered() {
        // Give the target the grace window to flush, then stop it.
        let deadline = Instant::now() + options.grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    break child.wait().ok();
                }
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(25)),
                Err(_) => break None,
            }
        }
    } else {
        child.wait().ok()
    };
    let _ = stderr_logger.join();
    let _ = stdout_logger.join();

    if let Some(err) = replay_error {
        return Err(err);
    }
    match status {
        Some(status) if status.success() => {}
        Some(status) => {
            return Err(AltoError::Pipeline {
                pipeline,
                message: format!("target exited with {status}"),
                exit_code: status.code(),
            });
        }
        None => {
            return Err(AltoError::Pipeline {
                pipeline,
                message: "target did not exit cleanly".to_string(),
                exit_code: None,
            });
        }
    }

    if let Some(map) = watermarks.as_object_mut() {
        map.entry("__version__".to_string())
            .or_insert_with(|| Value::from(index.version));
    }
    tracing::info!(pipeline, files_replayed, "Reservoir replay completed");
    Ok(ReplayOutcome {
        watermarks,
        files_replayed,
    })
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Merge small partitions that share a schema fingerprint.
///
/// Gzip members concatenate into a valid multi-member stream, so merging
/// is byte concatenation into the newest file of each merge set. Bumps the
/// index version so replay watermarks re-derive from the listing.
///
/// # Errors
///
/// Returns a storage error when reads, writes, or the index update fail.
pub fn compact_reservoir(store: &dyn StorageBackend, prefix: &str, owner: &str) -> Result<u64> {
    let _lock = IngestLock::acquire(store, prefix, owner)?;
    let mut index = ReservoirIndex::load_or_rebuild(store, prefix)?;
    let mut merged_files = 0u64;

    for (stream, entries) in &mut index.streams {
        if entries.len() < 2 {
            continue;
        }
        let mut by_schema: BTreeMap<String, Vec<PartitionEntry>> = BTreeMap::new();
        for entry in entries.iter() {
            by_schema
                .entry(entry.schema_fp().to_string())
                .or_default()
                .push(entry.clone());
        }
        let mut surviving: Vec<PartitionEntry> = Vec::new();
        for (fp, group) in by_schema {
            let mut small = Vec::new();
            let mut large = Vec::new();
            for entry in group {
                let size = store.get(&entry.key).map(|b| b.len() as u64).unwrap_or(0);
                if size < COMPACTION_THRESHOLD_BYTES {
                    small.push(entry);
                } else {
                    large.push(entry);
                }
            }
            surviving.extend(large);
            if small.len() < 2 {
                surviving.extend(small);
                continue;
            }
            small.sort_by(|a, b| a.key.cmp(&b.key));
            tracing::info!(stream, schema_fp = %fp, files = small.len(), "Compacting partition group");
            let mut merged = Vec::new();
            let mut count = 0u64;
            for entry in &small {
                merged.extend(store.get(&entry.key)?);
                count += entry.count;
            }
            let keep = small.last().expect("at least two entries").clone();
            store.put_atomic(&keep.key, &merged)?;
            for entry in &small[..small.len() - 1] {
                store.remove(&entry.key)?;
                merged_files += 1;
            }
            surviving.push(PartitionEntry {
                key: keep.key,
                count,
                written_at: chrono::Utc::now().to_rfc3339(),
            });
        }
        surviving.sort_by(|a, b| a.key.cmp(&b.key));
        *entries = surviving;
    }

    if merged_files > 0 {
        index.version += 1;
        index.save(store, prefix)?;
        tracing::info!(prefix, merged_files, version = index.version, "Reservoir compacted");
    }
    Ok(merged_files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alto_store::LocalBackend;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("store")).unwrap();
        (dir, backend)
    }

    fn schema_line(stream: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "SCHEMA",
            "stream": stream,
            "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}
        }))
        .unwrap()
    }

    fn record_line(stream: &str, id: u64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "RECORD",
            "stream": stream,
            "record": {"id": id}
        }))
        .unwrap()
    }

    fn decompress(bytes: &[u8]) -> String {
        let mut decoder = MultiGzDecoder::new(bytes);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn schema_fingerprint_is_15_hex_and_schema_sensitive() {
        let a = schema_fingerprint("orders", &json!({"type": "object"}));
        assert_eq!(a.len(), 15);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        let b = schema_fingerprint("orders", &json!({"type": "object", "properties": {}}));
        assert_ne!(a, b);
        let c = schema_fingerprint("customers", &json!({"type": "object"}));
        assert_ne!(a, c);
        // Canonical: key order in the source document is irrelevant.
        let d = schema_fingerprint(
            "orders",
            &json!({"properties": {"a": 1, "b": 2}, "type": "object"}),
        );
        let e = schema_fingerprint(
            "orders",
            &json!({"type": "object", "properties": {"b": 2, "a": 1}}),
        );
        assert_eq!(d, e);
    }

    #[test]
    fn writer_partitions_by_stream_and_schema() {
        let (_dir, backend) = store();
        let mut writer =
            ReservoirWriter::open(&backend, "reservoir/dev/tap-x".into(), 10_000, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        writer.observe_line(&record_line("orders", 1)).unwrap();
        writer.observe_line(&record_line("orders", 2)).unwrap();
        writer.observe_line(&schema_line("customers")).unwrap();
        writer.observe_line(&record_line("customers", 1)).unwrap();
        writer
            .observe_line(br#"{"type": "STATE", "value": {"bookmarks": {"orders": "x"}}}"#)
            .unwrap();
        let (written, state) = writer.finalize().unwrap();
        assert_eq!(written, 2);
        assert_eq!(state.unwrap(), json!({"bookmarks": {"orders": "x"}}));

        let index = ReservoirIndex::load_or_rebuild(&backend, "reservoir/dev/tap-x").unwrap();
        assert_eq!(index.streams["orders"].len(), 1);
        assert_eq!(index.streams["orders"][0].count, 2);
        assert_eq!(index.streams["customers"][0].count, 1);

        // Every partition opens with its SCHEMA header.
        let payload = decompress(&backend.get(&index.streams["orders"][0].key).unwrap());
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("SCHEMA"));
        assert!(lines[1].contains("\"id\":1"));
        assert!(lines[2].contains("\"id\":2"));
    }

    #[test]
    fn buffer_threshold_triggers_intermediate_flush() {
        let (_dir, backend) = store();
        let mut writer =
            ReservoirWriter::open(&backend, "reservoir/dev/tap-x".into(), 2, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        for id in 0..5 {
            writer.observe_line(&record_line("orders", id)).unwrap();
        }
        let (written, _) = writer.finalize().unwrap();
        // Two full partitions of two records plus the final single-record flush.
        assert_eq!(written, 3);
        let index = ReservoirIndex::load_or_rebuild(&backend, "reservoir/dev/tap-x").unwrap();
        let counts: Vec<u64> = index.streams["orders"].iter().map(|e| e.count).collect();
        assert_eq!(counts.iter().sum::<u64>(), 5);
    }

    #[test]
    fn schema_change_opens_a_new_partition_directory() {
        let (_dir, backend) = store();
        let mut writer =
            ReservoirWriter::open(&backend, "reservoir/dev/tap-x".into(), 10_000, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        writer.observe_line(&record_line("orders", 1)).unwrap();
        let evolved = serde_json::to_vec(&json!({
            "type": "SCHEMA",
            "stream": "orders",
            "schema": {"type": "object", "properties": {"id": {"type": "integer"}, "note": {"type": "string"}}}
        }))
        .unwrap();
        writer.observe_line(&evolved).unwrap();
        writer.observe_line(&record_line("orders", 2)).unwrap();
        writer.finalize().unwrap();

        let index = ReservoirIndex::load_or_rebuild(&backend, "reservoir/dev/tap-x").unwrap();
        let fps: std::collections::BTreeSet<&str> = index.streams["orders"]
            .iter()
            .map(PartitionEntry::schema_fp)
            .collect();
        assert_eq!(fps.len(), 2);
    }

    #[test]
    fn record_before_schema_fails_ingest() {
        let (_dir, backend) = store();
        let mut writer =
            ReservoirWriter::open(&backend, "reservoir/dev/tap-x".into(), 10_000, None).unwrap();
        let err = writer.observe_line(&record_line("orders", 1)).unwrap_err();
        assert!(err.to_string().contains("before its SCHEMA"));
    }

    #[test]
    fn existing_partitions_are_never_rewritten() {
        let (_dir, backend) = store();
        let prefix = "reservoir/dev/tap-x";
        let mut writer = ReservoirWriter::open(&backend, prefix.into(), 10_000, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        writer.observe_line(&record_line("orders", 1)).unwrap();
        writer.finalize().unwrap();

        let index = ReservoirIndex::load_or_rebuild(&backend, prefix).unwrap();
        let first_key = index.streams["orders"][0].key.clone();
        let first_bytes = backend.get(&first_key).unwrap();

        let mut writer = ReservoirWriter::open(&backend, prefix.into(), 10_000, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        writer.observe_line(&record_line("orders", 2)).unwrap();
        writer.finalize().unwrap();

        let index = ReservoirIndex::load_or_rebuild(&backend, prefix).unwrap();
        assert_eq!(index.streams["orders"].len(), 2);
        assert_eq!(backend.get(&first_key).unwrap(), first_bytes);
    }

    #[test]
    fn index_rebuild_from_listing() {
        let (_dir, backend) = store();
        backend
            .put("reservoir/dev/tap-x/orders/abc/20240101000000000001.singer.gz", b"gz")
            .unwrap();
        backend
            .put("reservoir/dev/tap-x/orders/abc/20240101000000000002.singer.gz", b"gz")
            .unwrap();
        let index = ReservoirIndex::load_or_rebuild(&backend, "reservoir/dev/tap-x").unwrap();
        assert_eq!(index.streams["orders"].len(), 2);
        assert!(index.streams["orders"][0].key < index.streams["orders"][1].key);
    }

    #[test]
    fn ingest_lock_excludes_concurrent_runs() {
        let (_dir, backend) = store();
        let lock = IngestLock::acquire(&backend, "reservoir/dev/tap-x", "run-1").unwrap();
        let err = IngestLock::acquire(&backend, "reservoir/dev/tap-x", "run-2").unwrap_err();
        assert!(err.to_string().contains("locked"));
        drop(lock);
        IngestLock::acquire(&backend, "reservoir/dev/tap-x", "run-3").unwrap();
    }

    #[test]
    fn compaction_merges_small_partitions_and_bumps_version() {
        let (_dir, backend) = store();
        let prefix = "reservoir/dev/tap-x";
        let mut writer = ReservoirWriter::open(&backend, prefix.into(), 1, None).unwrap();
        writer.observe_line(&schema_line("orders")).unwrap();
        for id in 0..3 {
            writer.observe_line(&record_line("orders", id)).unwrap();
        }
        writer.finalize().unwrap();
        let before = ReservoirIndex::load_or_rebuild(&backend, prefix).unwrap();
        assert_eq!(before.streams["orders"].len(), 3);

        let merged = compact_reservoir(&backend, prefix, "compactor").unwrap();
        assert_eq!(merged, 2);
        let after = ReservoirIndex::load_or_rebuild(&backend, prefix).unwrap();
        assert_eq!(after.streams["orders"].len(), 1);
        assert_eq!(after.version, before.version + 1);
        assert_eq!(after.streams["orders"][0].count, 3);

        // The surviving multi-member gzip decompresses to all records.
        let payload = decompress(&backend.get(&after.streams["orders"][0].key).unwrap());
        assert_eq!(payload.lines().filter(|l| l.contains("RECORD")).count(), 3);
    }

    #[test]
    fn watermark_sync_on_version_move() {
        let mut index = ReservoirIndex::default();
        index.version = 2;
        index.streams.insert(
            "orders".into(),
            vec![
                PartitionEntry {
                    key: "reservoir/dev/tap-x/orders/abc/0002.singer.gz".into(),
                    count: 1,
                    written_at: String::new(),
                },
                PartitionEntry {
                    key: "reservoir/dev/tap-x/orders/abc/0005.singer.gz".into(),
                    count: 1,
                    written_at: String::new(),
                },
            ],
        );
        let mut watermarks = json!({"__version__": 1, "orders": {"emitted": "0001.singer.gz"}});
        sync_watermarks(&mut watermarks, &index);
        assert_eq!(watermarks["__version__"], 2);
        assert_eq!(watermarks["orders"]["emitted"], "0005.singer.gz");

        // Streams the replay never saw stay untracked.
        let mut fresh = json!({"__version__": 1});
        sync_watermarks(&mut fresh, &index);
        assert!(fresh.get("orders").is_none());
    }
}
