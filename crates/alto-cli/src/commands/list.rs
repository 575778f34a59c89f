use std::path::Path;

use anyhow::Result;

use super::open_engine;

/// Print the tasks the configuration implies.
///
/// Accent config tasks (`config:<target>--<tap>`) are plumbing and hidden
/// unless `--all` is passed.
pub fn execute(root: Option<&Path>, all: bool) -> Result<i32> {
    let engine = open_engine(root)?;
    for (id, doc) in engine.list_tasks()? {
        if !all && id.kind() == "config" && id.arg().is_some_and(|arg| arg.contains("--")) {
            continue;
        }
        println!("{:<40} {doc}", id.as_str());
    }
    Ok(0)
}
