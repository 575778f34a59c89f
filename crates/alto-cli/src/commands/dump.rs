use std::path::Path;

use anyhow::{Context, Result};

use crate::config_loader;

/// Print the effective merged configuration as JSON.
pub fn execute(root: Option<&Path>) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => config_loader::find_project_root(&cwd)?,
    };
    let env = config_loader::active_env();
    let effective = config_loader::load_effective(&root, &env)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::Value::Object(effective.tree))?
    );
    Ok(0)
}
