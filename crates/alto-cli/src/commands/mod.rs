//! Command implementations.

pub mod clean;
pub mod dump;
pub mod init;
pub mod invoke;
pub mod list;
pub mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use alto_engine::AltoEngine;
use alto_store::LocalBackend;
use alto_types::config::EffectiveConfig;

use crate::config_loader;

/// Resolve the storage backend the configuration points at.
///
/// `filesystem: file` (the default) stores under `storage_root` when set,
/// otherwise under `~/.alto/<project_name>`. Remote drivers (s3, gs,
/// azure) plug in behind the same trait and ship outside this workspace.
fn open_store(config: &EffectiveConfig) -> Result<Arc<LocalBackend>> {
    let scheme = config.get_str("filesystem").unwrap_or("file");
    if scheme != "file" {
        bail!(
            "filesystem `{scheme}` requires an external storage driver; \
             only `file` ships with this build"
        );
    }
    let root = match config.get_str("storage_root") {
        Some(path) => PathBuf::from(path),
        None => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home)
                .join(".alto")
                .join(config.project_name()?)
        }
    };
    Ok(Arc::new(LocalBackend::new(root)?))
}

/// Locate the project, resolve the environment, and assemble an engine.
pub fn open_engine(root_override: Option<&Path>) -> Result<AltoEngine> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let root = match root_override {
        Some(root) => root.to_path_buf(),
        None => config_loader::find_project_root(&cwd)?,
    };
    let env = config_loader::active_env();
    let config = config_loader::load_effective(&root, &env)?;
    tracing::info!(
        project = config.project_name().unwrap_or("?"),
        env = env,
        root = %root.display(),
        "Project loaded"
    );
    let store = open_store(&config)?;
    Ok(AltoEngine::new(root, config, store)?)
}
