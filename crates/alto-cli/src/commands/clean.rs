use std::path::Path;

use anyhow::Result;

use super::open_engine;

/// Run the clean actions of the selected tasks.
pub fn execute(root: Option<&Path>, selectors: &[String]) -> Result<i32> {
    let engine = open_engine(root)?;
    engine.clean(selectors)?;
    println!("cleaned: {}", selectors.join(", "));
    Ok(0)
}
