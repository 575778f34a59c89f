use std::path::Path;

use anyhow::{bail, Result};

const CONFIG_TEMPLATE: &str = r#"default:
  project_name: my-project
  load_path: raw
  taps:
    tap-carbon-intensity:
      install_url: "git+https://gitlab.com/meltano/tap-carbon-intensity.git#egg=tap_carbon_intensity"
      load_path: carbon_intensity
      capabilities: [state, catalog]
      select: ["*.*"]
      config:
        any_key: "<this will end up in a config.json passed to the tap>"
  targets:
    target-jsonl:
      install_url: "target-jsonl==0.1.4"
      config:
        destination_path: output
"#;

const SECRETS_TEMPLATE: &str = r#"default:
  taps:
    tap-carbon-intensity:
      config:
        some_secret: "<I will be merged into alto.yaml>"
  targets:
    target-jsonl:
      config:
        other_secret: "<use this file for secret management>"
"#;

/// Scaffold a new project in `dir`.
pub fn execute(dir: &Path) -> Result<i32> {
    for existing in ["alto.yaml", "alto.yml", "alto.json"] {
        if dir.join(existing).exists() {
            bail!("an alto project file already exists in {}", dir.display());
        }
    }
    std::fs::write(dir.join("alto.yaml"), CONFIG_TEMPLATE)?;
    std::fs::write(dir.join("alto.secrets.yaml"), SECRETS_TEMPLATE)?;
    println!("created alto.yaml and alto.secrets.yaml in {}", dir.display());
    println!("exclude alto.secrets.yaml from source control");
    Ok(0)
}
