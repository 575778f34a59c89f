//! The Alto engine: task DAG, plugin lifecycle, and Singer runtime.
//!
//! The engine consumes an already-merged, already-interpolated
//! configuration tree ([`alto_types::config::EffectiveConfig`]) and a
//! storage handle ([`alto_store::StorageBackend`]), discovers tasks from
//! the declarations it finds, and executes the ones that are out of date.
//!
//! Subsystem map:
//!
//! - [`fingerprint`] - stable identity of artifacts and task inputs
//! - [`artifact`] - build-once/cache-forever plugin executables
//! - [`project`] - per-plugin and per-pipeline configuration views
//! - [`catalog`] - discovery plus the runtime-catalog pipeline
//! - [`state`] - bookmark materialization and atomic write-back
//! - [`pipeline`] - the tap-to-target process chain
//! - [`reservoir`] - partitioned Singer archive, ingest and replay
//! - [`tasks`] - the DAG, records, and executors
//! - [`orchestrator`] - task discovery wiring it all together

#![warn(clippy::pedantic)]

pub mod artifact;
pub mod catalog;
pub mod fingerprint;
pub mod orchestrator;
pub mod paths;
pub mod pipeline;
pub mod project;
pub mod reservoir;
pub mod state;
pub mod tasks;

pub use artifact::{ArtifactCache, PackagerConfig};
pub use fingerprint::{plugin_fingerprint, task_fingerprint, BuildTags};
pub use orchestrator::AltoEngine;
pub use paths::ProjectLayout;
pub use pipeline::{PiiHasher, PipelineOptions, ProcessSpec, Shutdown};
pub use project::Projection;
pub use state::StateStore;
pub use tasks::{ExecutionReport, Freshness, Task, TaskDb, TaskGraph, TaskProvider};
