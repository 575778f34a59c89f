//! Content-addressed plugin artifact cache.
//!
//! An artifact is a self-contained executable built once per fingerprint
//! and never mutated. Resolution order: local cache directory, remote
//! store, build. Concurrent builds of the same fingerprint coalesce behind
//! an exclusive lock file named by the fingerprint; waiters re-check the
//! local cache after acquiring it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs4::FileExt;

use alto_store::{with_retries, StorageBackend, DEFAULT_MAX_ATTEMPTS};
use alto_types::plugin::PluginSpec;
use alto_types::{AltoError, Result};

use crate::fingerprint::{plugin_fingerprint, BuildTags};
use crate::paths::ProjectLayout;

/// How to invoke the packager that turns an install URL into a
/// single-file executable.
#[derive(Debug, Clone)]
pub struct PackagerConfig {
    /// Packager program (e.g. `pex`).
    pub program: String,
    /// Arguments inserted before the output flag.
    pub args: Vec<String>,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            program: "pex".to_string(),
            args: vec!["--no-emit-warnings".to_string()],
        }
    }
}

/// The artifact cache; exclusive owner of `plugins/<fingerprint>` keys.
pub struct ArtifactCache<'a> {
    layout: &'a ProjectLayout,
    store: &'a dyn StorageBackend,
    packager: PackagerConfig,
    tags: BuildTags,
}

struct BuildLock {
    file: fs::File,
    path: PathBuf,
}

impl BuildLock {
    /// Block until this process holds the per-fingerprint lock.
    fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::options()
            .create(true)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(Self { file, path })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

impl<'a> ArtifactCache<'a> {
    #[must_use]
    pub fn new(
        layout: &'a ProjectLayout,
        store: &'a dyn StorageBackend,
        packager: PackagerConfig,
        tags: BuildTags,
    ) -> Self {
        Self {
            layout,
            store,
            packager,
            tags,
        }
    }

    /// Fingerprint of a spec under this cache's build tags.
    #[must_use]
    pub fn fingerprint(&self, spec: &PluginSpec) -> String {
        plugin_fingerprint(spec, &self.tags)
    }

    /// Resolve a spec to a local executable, building at most once per
    /// fingerprint across concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::Build`] when the packager fails (its output is
    /// attached), or a storage error when promotion fails.
    pub fn get_or_build(&self, spec: &PluginSpec) -> Result<PathBuf> {
        let fp = self.fingerprint(spec);
        let local = self.layout.plugin_path(&fp);
        if local.is_file() {
            self.promote_if_missing(&fp, &local)?;
            return Ok(local);
        }

        let _lock = BuildLock::acquire(self.layout.plugin_lock_path(&fp))?;
        // Another holder may have produced the artifact while we waited.
        if local.is_file() {
            return Ok(local);
        }

        let remote_key = ProjectLayout::remote_plugin_key(&fp);
        if with_retries("plugins.exists", DEFAULT_MAX_ATTEMPTS, || {
            self.store.exists(&remote_key)
        })? {
            tracing::info!(plugin = spec.name, fingerprint = %fp, "Fetching artifact from remote cache");
            let bytes = with_retries("plugins.get", DEFAULT_MAX_ATTEMPTS, || {
                self.store.get(&remote_key)
            })?;
            write_executable(&local, &bytes)?;
            return Ok(local);
        }

        self.build(spec, &fp, &local)?;
        Ok(local)
    }

    /// Drop a spec's artifact from the local and remote caches.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the remote object cannot be removed.
    pub fn remove(&self, spec: &PluginSpec) -> Result<()> {
        let fp = self.fingerprint(spec);
        let local = self.layout.plugin_path(&fp);
        if local.is_file() {
            fs::remove_file(&local)?;
        }
        let remote_key = ProjectLayout::remote_plugin_key(&fp);
        if self.store.exists(&remote_key)? {
            self.store.remove(&remote_key)?;
        }
        Ok(())
    }

    /// Upload a locally present artifact the remote store is missing.
    fn promote_if_missing(&self, fp: &str, local: &Path) -> Result<()> {
        let remote_key = ProjectLayout::remote_plugin_key(fp);
        let missing = !with_retries("plugins.exists", DEFAULT_MAX_ATTEMPTS, || {
            self.store.exists(&remote_key)
        })?;
        if missing {
            let bytes = fs::read(local)?;
            with_retries("plugins.put", DEFAULT_MAX_ATTEMPTS, || {
                self.store.put(&remote_key, &bytes)
            })?;
        }
        Ok(())
    }

    fn build(&self, spec: &PluginSpec, fp: &str, local: &Path) -> Result<()> {
        if spec.install_url.trim().is_empty() {
            return Err(AltoError::config(
                format!("{}.{}.install_url", spec.kind.section(), spec.name),
                "missing required field",
            ));
        }

        let partial = local.with_extension("partial");
        let mut command = Command::new(&self.packager.program);
        command.args(&self.packager.args);
        command.arg("-o").arg(&partial);
        command.args(spec.install_url.split_whitespace());
        match &spec.entrypoint {
            Some(entrypoint) => {
                command.arg("-m").arg(entrypoint);
            }
            None => {
                command.arg("-c").arg(spec.executable_name());
            }
        }

        tracing::info!(plugin = spec.name, fingerprint = %fp, "Building plugin artifact");
        let output = command.output().map_err(|err| AltoError::Build {
            plugin: spec.name.clone(),
            message: format!("failed to launch packager `{}`: {err}", self.packager.program),
            log: String::new(),
        })?;

        if !output.status.success() {
            let _ = fs::remove_file(&partial);
            let mut log = String::from_utf8_lossy(&output.stderr).into_owned();
            if log.is_empty() {
                log = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(AltoError::Build {
                plugin: spec.name.clone(),
                message: format!("packager exited with {}", output.status),
                log,
            });
        }
        if !partial.is_file() {
            return Err(AltoError::Build {
                plugin: spec.name.clone(),
                message: "packager reported success but produced no output".to_string(),
                log: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        set_executable(&partial)?;
        let bytes = fs::read(&partial)?;
        with_retries("plugins.put", DEFAULT_MAX_ATTEMPTS, || {
            self.store
                .put(&ProjectLayout::remote_plugin_key(fp), &bytes)
        })?;
        fs::rename(&partial, local)?;
        tracing::info!(plugin = spec.name, fingerprint = %fp, "Artifact built and promoted");
        Ok(())
    }
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    set_executable(path)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
