//! Project filesystem layout and the per-run staging directory.
//!
//! Two worlds of paths exist. *Local* paths live under the project root:
//! the `.alto/` cache directory (artifacts, logs, task records) and a
//! random-suffixed staging directory torn down when the run ends. *Remote*
//! keys address the shared storage backend and follow the persisted layout:
//!
//! ```text
//! catalogs/<tap>.base.json
//! plugins/<fingerprint>
//! reservoir/<env>/<tap>/...
//! state/<env>/<tap>-to-<target>.json
//! logs/<env>/<file>
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use alto_types::Result;

/// Directory under the project root for caches and transient data.
pub const ALTO_DIR: &str = ".alto";
/// Task-record file at the project root.
pub const RECORD_FILE: &str = ".alto.json";

static STAGING_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A per-run scratch directory, removed on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(alto_dir: &Path) -> Result<Self> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let suffix = format!(
            "{:08x}{:04x}",
            nanos ^ std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = alto_dir.join(format!("run-{suffix}"));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// The staging root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove staging directory: {err}");
            }
        }
    }
}

/// Resolved path layout for one project and environment.
#[derive(Debug)]
pub struct ProjectLayout {
    root_dir: PathBuf,
    env: String,
    staging: StagingDir,
}

impl ProjectLayout {
    /// Open the layout rooted at the directory holding the project file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the cache or staging directory cannot be
    /// created.
    pub fn open(root_dir: impl Into<PathBuf>, env: &str) -> Result<Self> {
        let root_dir = root_dir.into();
        let alto_dir = root_dir.join(ALTO_DIR);
        fs::create_dir_all(alto_dir.join("plugins"))?;
        let staging = StagingDir::create(&alto_dir)?;
        Ok(Self {
            root_dir,
            env: env.to_string(),
            staging,
        })
    }

    /// The project root directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Active environment name.
    #[must_use]
    pub fn env(&self) -> &str {
        &self.env
    }

    /// The per-run staging root.
    #[must_use]
    pub fn staging(&self) -> &Path {
        self.staging.path()
    }

    /// Task-record file written by the coordinator only.
    #[must_use]
    pub fn record_file(&self) -> PathBuf {
        self.root_dir.join(RECORD_FILE)
    }

    /// Local home of a built artifact.
    #[must_use]
    pub fn plugin_path(&self, fingerprint: &str) -> PathBuf {
        self.root_dir.join(ALTO_DIR).join("plugins").join(fingerprint)
    }

    /// Lock file guarding a build of one fingerprint.
    #[must_use]
    pub fn plugin_lock_path(&self, fingerprint: &str) -> PathBuf {
        self.plugin_path(fingerprint).with_extension("lock")
    }

    /// Log directory, partitioned by environment.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created.
    pub fn log_path(&self, file_name: &str) -> Result<PathBuf> {
        let dir = self.root_dir.join(ALTO_DIR).join("logs").join(&self.env);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(file_name))
    }

    fn staged(&self, key: &str, file_name: &str) -> Result<PathBuf> {
        let dir = self.staging.path().join(key);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(file_name))
    }

    /// Staged plugin configuration file, optionally accented for a
    /// specific counterpart plugin.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the staging subdirectory cannot be created.
    pub fn config_path(&self, plugin: &str, accent: Option<&str>) -> Result<PathBuf> {
        let file_name = match accent {
            Some(accent) => format!("{plugin}--{accent}.json"),
            None => format!("{plugin}.json"),
        };
        self.staged("config", &file_name)
    }

    /// Staged copy of a tap's base catalog.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the staging subdirectory cannot be created.
    pub fn base_catalog_path(&self, tap: &str) -> Result<PathBuf> {
        self.staged("catalogs", &format!("{tap}.base.json"))
    }

    /// Staged runtime catalog for a tap.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the staging subdirectory cannot be created.
    pub fn catalog_path(&self, tap: &str) -> Result<PathBuf> {
        self.staged("catalogs", &format!("{tap}.json"))
    }

    /// Staged active-state file for a pipeline pair.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the staging subdirectory cannot be created.
    pub fn state_path(&self, tap: &str, target: &str) -> Result<PathBuf> {
        self.staged("state", &format!("{tap}-to-{target}.json"))
    }

    // Remote keys ---------------------------------------------------------

    /// Remote key of a built artifact.
    #[must_use]
    pub fn remote_plugin_key(fingerprint: &str) -> String {
        format!("plugins/{fingerprint}")
    }

    /// Remote key of a tap's base catalog. Keyed by tap name alone, not by
    /// fingerprint; `clean catalog:<tap>` resets it after an install-URL
    /// change.
    #[must_use]
    pub fn remote_base_catalog_key(tap: &str) -> String {
        format!("catalogs/{tap}.base.json")
    }

    /// Remote key of the active state for a pipeline pair.
    #[must_use]
    pub fn remote_state_key(&self, tap: &str, target: &str) -> String {
        format!("state/{}/{tap}-to-{target}.json", self.env)
    }

    /// Remote key of a historical state snapshot.
    #[must_use]
    pub fn remote_state_snapshot_key(&self, tap: &str, target: &str, timestamp: &str) -> String {
        format!("state/{}/{tap}-to-{target}.{timestamp}.json", self.env)
    }

    /// Remote key prefix of a tap's reservoir.
    #[must_use]
    pub fn reservoir_prefix(&self, tap: &str) -> String {
        format!("reservoir/{}/{tap}", self.env)
    }

    /// Remote key of an uploaded log file.
    #[must_use]
    pub fn remote_log_key(&self, file_name: &str) -> String {
        format!("logs/{}/{file_name}", self.env)
    }
}

/// The reservoir counterpart name of a tap (`tap-x` becomes `reservoir-x`),
/// used to key the watermark state of a replay pair.
#[must_use]
pub fn reservoir_name(tap: &str) -> String {
    tap.strip_prefix("tap")
        .map_or_else(|| format!("reservoir-{tap}"), |rest| format!("reservoir{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (tempfile::TempDir, ProjectLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::open(dir.path(), "dev").unwrap();
        (dir, layout)
    }

    #[test]
    fn staging_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let staged;
        {
            let layout = ProjectLayout::open(dir.path(), "dev").unwrap();
            staged = layout.staging().to_path_buf();
            assert!(staged.exists());
        }
        assert!(!staged.exists());
    }

    #[test]
    fn staged_paths_live_under_staging() {
        let (_dir, layout) = layout();
        let config = layout.config_path("tap-x", None).unwrap();
        assert!(config.starts_with(layout.staging()));
        assert!(config.ends_with("config/tap-x.json"));
        let accented = layout.config_path("target-y", Some("tap-x")).unwrap();
        assert!(accented.ends_with("config/target-y--tap-x.json"));
    }

    #[test]
    fn remote_keys_follow_persisted_layout() {
        let (_dir, layout) = layout();
        assert_eq!(ProjectLayout::remote_plugin_key("abc"), "plugins/abc");
        assert_eq!(
            ProjectLayout::remote_base_catalog_key("tap-x"),
            "catalogs/tap-x.base.json"
        );
        assert_eq!(
            layout.remote_state_key("tap-x", "target-y"),
            "state/dev/tap-x-to-target-y.json"
        );
        assert_eq!(
            layout.remote_state_snapshot_key("tap-x", "target-y", "20240101000000"),
            "state/dev/tap-x-to-target-y.20240101000000.json"
        );
        assert_eq!(layout.reservoir_prefix("tap-x"), "reservoir/dev/tap-x");
    }

    #[test]
    fn reservoir_names() {
        assert_eq!(reservoir_name("tap-x"), "reservoir-x");
        assert_eq!(reservoir_name("custom-extractor"), "reservoir-custom-extractor");
    }

    #[test]
    fn two_layouts_get_distinct_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let a = ProjectLayout::open(dir.path(), "dev").unwrap();
        let b = ProjectLayout::open(dir.path(), "dev").unwrap();
        assert_ne!(a.staging(), b.staging());
    }
}
