use std::path::Path;

use anyhow::Result;

use alto_types::AltoError;

use super::open_engine;

/// Execute the selected tasks; returns the process exit code.
pub fn execute(
    root: Option<&Path>,
    selectors: &[String],
    parallel: Option<usize>,
) -> Result<i32> {
    let engine = open_engine(root)?;
    match engine.run(selectors, parallel) {
        Ok(report) => {
            for (id, status) in &report.statuses {
                println!("{status:>9}  {id}");
            }
            Ok(0)
        }
        Err(err) => {
            tracing::error!("Run failed: {err}");
            // The exit code mirrors the failing task's own exit code.
            let code = match &err {
                AltoError::Pipeline {
                    exit_code: Some(code),
                    ..
                } => *code,
                _ => 1,
            };
            eprintln!("error: {err}");
            Ok(code.max(1))
        }
    }
}
