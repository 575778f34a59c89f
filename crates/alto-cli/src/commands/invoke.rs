use std::path::Path;

use anyhow::Result;

use super::open_engine;

/// Build (if needed) and run a plugin with pass-through arguments.
pub fn execute(root: Option<&Path>, plugin: &str, args: &[String]) -> Result<i32> {
    let engine = open_engine(root)?;
    Ok(engine.invoke(plugin, args)?)
}
