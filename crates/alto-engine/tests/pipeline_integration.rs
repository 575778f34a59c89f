//! Pipeline and reservoir integration tests driven by stub Singer
//! plugins implemented as shell scripts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use alto_engine::pipeline::{run_pipeline, PiiHasher, PipelineOptions, ProcessSpec, Shutdown};
use alto_engine::reservoir::{run_reservoir_to_target, run_tap_to_reservoir, ReservoirIndex};
use alto_engine::ProjectLayout;
use alto_store::{LocalBackend, StorageBackend};
use alto_types::AltoError;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn options() -> PipelineOptions {
    PipelineOptions {
        grace: Duration::from_millis(200),
        ..PipelineOptions::default()
    }
}

/// A tap that emits one stream with three records and two STATE lines.
fn emitting_tap(dir: &Path) -> ProcessSpec {
    let script = write_script(
        dir,
        "tap.sh",
        r#"
printf '%s\n' '{"type": "SCHEMA", "stream": "customers", "schema": {"type": "object", "properties": {"id": {"type": "integer"}, "email": {"type": "string"}}}}'
printf '%s\n' '{"type": "RECORD", "stream": "customers", "record": {"id": 1, "email": "a@example.com"}}'
printf '%s\n' '{"type": "STATE", "value": {"bookmarks": {"customers": "1"}}}'
printf '%s\n' '{"type": "RECORD", "stream": "customers", "record": {"id": 2, "email": "b@example.com"}}'
printf '%s\n' '{"type": "RECORD", "stream": "customers", "record": {"id": 3, "email": null}}'
printf '%s\n' '{"type": "STATE", "value": {"bookmarks": {"customers": "3"}}}'
"#,
    );
    ProcessSpec::new(script)
}

/// A target that copies every line to a file and echoes STATE lines.
fn recording_target(dir: &Path, sink: &Path) -> ProcessSpec {
    let script = write_script(
        dir,
        "target.sh",
        &format!("tee -a {} | grep '\"STATE\"'", sink.display()),
    );
    ProcessSpec::new(script)
}

fn read_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn pipeline_delivers_messages_and_folds_state() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();
    let sink = dir.path().join("out.jsonl");

    let outcome = run_pipeline(
        &layout,
        "tap-x:target-y",
        &emitting_tap(dir.path()),
        &[],
        &recording_target(dir.path(), &sink),
        PiiHasher::default(),
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap();

    let lines = read_lines(&sink);
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0]["type"], "SCHEMA");
    // Records arrive in emission order.
    assert_eq!(lines[1]["record"]["id"], 1);
    assert_eq!(lines[3]["record"]["id"], 2);
    assert_eq!(lines[4]["record"]["id"], 3);

    // The fold reflects the last STATE line.
    assert_eq!(
        outcome.new_state.unwrap(),
        json!({"bookmarks": {"customers": "3"}})
    );
}

#[test]
fn pipeline_preserves_order_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();
    let sink = dir.path().join("out.jsonl");

    let tap = write_script(
        dir.path(),
        "tap.sh",
        r#"
printf '%s\n' '{"type": "SCHEMA", "stream": "seq", "schema": {"type": "object"}}'
i=0
while [ $i -lt 500 ]; do
  printf '{"type": "RECORD", "stream": "seq", "record": {"n": %d}}\n' $i
  i=$((i+1))
done
printf '%s\n' '{"type": "STATE", "value": {"n": 499}}'
"#,
    );
    let target = write_script(
        dir.path(),
        "target.sh",
        &format!("cat >> {}", sink.display()),
    );

    run_pipeline(
        &layout,
        "tap-seq:target-y",
        &ProcessSpec::new(tap),
        &[],
        &ProcessSpec::new(target),
        PiiHasher::default(),
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap();

    let lines = read_lines(&sink);
    let ns: Vec<i64> = lines
        .iter()
        .filter(|l| l["type"] == "RECORD")
        .map(|l| l["record"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns.len(), 500);
    assert!(ns.windows(2).all(|w| w[0] + 1 == w[1]), "records reordered");
}

#[test]
fn pii_fields_are_hashed_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();

    let mut fields = BTreeMap::new();
    fields.insert(
        "customers".to_string(),
        ["email".to_string()].into_iter().collect::<BTreeSet<_>>(),
    );

    let mut digests = Vec::new();
    for run in 0..2 {
        let sink = dir.path().join(format!("out-{run}.jsonl"));
        run_pipeline(
            &layout,
            "tap-x:target-y",
            &emitting_tap(dir.path()),
            &[],
            &recording_target(dir.path(), &sink),
            PiiHasher::new("demo-project", fields.clone()),
            None,
            &options(),
            &Shutdown::new(),
        )
        .unwrap();

        let lines = read_lines(&sink);
        let email = lines[1]["record"]["email"].as_str().unwrap().to_string();
        assert_eq!(email.len(), 64, "expected a 64-hex digest, got {email}");
        assert!(email.chars().all(|c| c.is_ascii_hexdigit()));
        // Untouched fields survive; null stays null.
        assert_eq!(lines[1]["record"]["id"], 1);
        assert_eq!(lines[4]["record"]["email"], Value::Null);
        digests.push(email);
    }
    // Same input, same salt: same digest across runs.
    assert_eq!(digests[0], digests[1]);
}

#[test]
fn stream_maps_filter_the_message_flow() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();
    let sink = dir.path().join("out.jsonl");

    let map = write_script(
        dir.path(),
        "map.sh",
        r#"awk '{gsub(/a@example.com/, "mapped@example.com"); print}'"#,
    );

    run_pipeline(
        &layout,
        "tap-x:target-y",
        &emitting_tap(dir.path()),
        &[ProcessSpec::new(map)],
        &recording_target(dir.path(), &sink),
        PiiHasher::default(),
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap();

    let lines = read_lines(&sink);
    assert_eq!(lines[1]["record"]["email"], "mapped@example.com");
    assert_eq!(lines[3]["record"]["email"], "b@example.com");
}

#[test]
fn failing_target_fails_the_pipeline_with_its_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();

    let target = write_script(dir.path(), "target.sh", "cat > /dev/null\nexit 7");
    let err = run_pipeline(
        &layout,
        "tap-x:target-y",
        &emitting_tap(dir.path()),
        &[],
        &ProcessSpec::new(target),
        PiiHasher::default(),
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap_err();

    match err {
        AltoError::Pipeline { exit_code, message, .. } => {
            assert_eq!(exit_code, Some(7));
            assert!(message.contains("target"), "got: {message}");
        }
        other => panic!("expected pipeline failure, got {other}"),
    }
}

#[test]
fn cancellation_terminates_a_stuck_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();

    let tap = write_script(dir.path(), "tap.sh", "sleep 30");
    let target = write_script(dir.path(), "target.sh", "cat > /dev/null");

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        trigger.trigger();
    });

    let started = Instant::now();
    let err = run_pipeline(
        &layout,
        "tap-x:target-y",
        &ProcessSpec::new(tap),
        &[],
        &ProcessSpec::new(target),
        PiiHasher::default(),
        None,
        &options(),
        &shutdown,
    )
    .unwrap_err();
    handle.join().unwrap();

    assert!(err.to_string().contains("terminated"), "got: {err}");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[test]
fn reservoir_roundtrip_delivers_every_record_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();
    let store = LocalBackend::new(dir.path().join("store")).unwrap();

    // Two streams, three flushes worth of partitions.
    let tap = write_script(
        dir.path(),
        "tap.sh",
        r#"
printf '%s\n' '{"type": "SCHEMA", "stream": "orders", "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}}'
printf '%s\n' '{"type": "RECORD", "stream": "orders", "record": {"id": 1}}'
printf '%s\n' '{"type": "RECORD", "stream": "orders", "record": {"id": 2}}'
printf '%s\n' '{"type": "RECORD", "stream": "orders", "record": {"id": 3}}'
printf '%s\n' '{"type": "SCHEMA", "stream": "customers", "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}}'
printf '%s\n' '{"type": "RECORD", "stream": "customers", "record": {"id": 10}}'
printf '%s\n' '{"type": "STATE", "value": {"bookmarks": {"orders": "3", "customers": "10"}}}'
"#,
    );

    let ingest = run_tap_to_reservoir(
        &layout,
        &store,
        "tap-x",
        &ProcessSpec::new(tap),
        2, // small buffer to force multiple partitions
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap();
    assert_eq!(ingest.partitions_written, 3);
    assert_eq!(
        ingest.new_state.unwrap(),
        json!({"bookmarks": {"orders": "3", "customers": "10"}})
    );

    let index = ReservoirIndex::load_or_rebuild(&store, "reservoir/dev/tap-x").unwrap();
    assert_eq!(index.streams["orders"].len(), 2);
    assert_eq!(index.streams["customers"].len(), 1);

    // Replay everything into a recording target.
    let sink = dir.path().join("replayed.jsonl");
    let target = write_script(
        dir.path(),
        "target.sh",
        &format!("cat >> {}", sink.display()),
    );
    let replay = run_reservoir_to_target(
        &layout,
        &store,
        "tap-x",
        &ProcessSpec::new(target),
        false,
        None,
        &options(),
        &Shutdown::new(),
    )
    .unwrap();
    assert_eq!(replay.files_replayed, 3);

    let lines = read_lines(&sink);
    let order_ids: Vec<i64> = lines
        .iter()
        .filter(|l| l["type"] == "RECORD" && l["stream"] == "orders")
        .map(|l| l["record"]["id"].as_i64().unwrap())
        .collect();
    assert_eq!(order_ids, vec![1, 2, 3]);
    let customer_ids: Vec<i64> = lines
        .iter()
        .filter(|l| l["type"] == "RECORD" && l["stream"] == "customers")
        .map(|l| l["record"]["id"].as_i64().unwrap())
        .collect();
    assert_eq!(customer_ids, vec![10]);

    // Watermarks advanced; a second replay has nothing to do.
    let sink2 = dir.path().join("replayed-2.jsonl");
    let target2 = write_script(
        dir.path(),
        "target2.sh",
        &format!("cat >> {}", sink2.display()),
    );
    let replay2 = run_reservoir_to_target(
        &layout,
        &store,
        "tap-x",
        &ProcessSpec::new(target2),
        false,
        Some(replay.watermarks),
        &options(),
        &Shutdown::new(),
    )
    .unwrap();
    assert_eq!(replay2.files_replayed, 0);
    assert!(read_lines(&sink2).is_empty());
}

#[test]
fn reservoir_runs_are_append_only() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ProjectLayout::open(dir.path().join("proj"), "dev").unwrap();
    let store = LocalBackend::new(dir.path().join("store")).unwrap();

    let tap = write_script(
        dir.path(),
        "tap.sh",
        r#"
printf '%s\n' '{"type": "SCHEMA", "stream": "orders", "schema": {"type": "object", "properties": {"id": {"type": "integer"}}}}'
printf '%s\n' '{"type": "RECORD", "stream": "orders", "record": {"id": 1}}'
"#,
    );
    let tap = ProcessSpec::new(tap);

    run_tap_to_reservoir(&layout, &store, "tap-x", &tap, 100, None, &options(), &Shutdown::new())
        .unwrap();
    let first: Vec<String> = store
        .list("reservoir/dev/tap-x")
        .unwrap()
        .into_iter()
        .filter(|k| k.ends_with(".singer.gz"))
        .collect();
    let first_bytes: Vec<Vec<u8>> = first.iter().map(|k| store.get(k).unwrap()).collect();

    run_tap_to_reservoir(&layout, &store, "tap-x", &tap, 100, None, &options(), &Shutdown::new())
        .unwrap();
    let second: Vec<String> = store
        .list("reservoir/dev/tap-x")
        .unwrap()
        .into_iter()
        .filter(|k| k.ends_with(".singer.gz"))
        .collect();

    // The partition set only grows and existing files are untouched.
    assert_eq!(second.len(), first.len() + 1);
    for (key, bytes) in first.iter().zip(first_bytes) {
        assert!(second.contains(key));
        assert_eq!(store.get(key).unwrap(), bytes);
    }
}
