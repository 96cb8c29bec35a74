//! Job table construction from plugin manifests.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use rampart_core::{JobSpec, Plugin};

/// One schedulable job: a spec plus where its executable lives.
#[derive(Debug, Clone)]
pub struct Job {
    pub plugin_id: String,
    pub spec: JobSpec,
    plugin_path: PathBuf,
}

impl Job {
    /// Absolute path of the executable, under the plugin's `jobs/` dir.
    pub fn command_path(&self) -> PathBuf {
        self.plugin_path.join("jobs").join(&self.spec.file)
    }
}

/// All jobs declared by the currently loaded plugins.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Vec<Job>,
}

impl JobTable {
    /// Scan plugin directories and build the table. Each immediate
    /// subdirectory holding a `plugin.json` is one plugin; a manifest that
    /// fails to load or validate contributes zero jobs and zero settings
    /// but never aborts the scan.
    pub fn load(plugin_dirs: &[PathBuf]) -> (Self, Vec<Plugin>) {
        let mut plugins = Vec::new();
        for dir in plugin_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "unreadable plugin directory, skipping");
                    continue;
                }
            };
            let mut subdirs: Vec<PathBuf> =
                entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
            subdirs.sort();
            for subdir in subdirs {
                let manifest = subdir.join("plugin.json");
                if !manifest.is_file() {
                    continue;
                }
                match Plugin::from_file(&manifest) {
                    Ok(plugin) => {
                        debug!(plugin = %plugin.id, jobs = plugin.jobs.len(), "loaded plugin");
                        plugins.push(plugin);
                    }
                    Err(e) => {
                        warn!(path = %manifest.display(), error = %e, "rejected plugin manifest");
                    }
                }
            }
        }
        (Self::from_plugins(&plugins), plugins)
    }

    pub fn from_plugins(plugins: &[Plugin]) -> Self {
        let jobs = plugins
            .iter()
            .flat_map(|plugin| {
                plugin.jobs.iter().map(|spec| Job {
                    plugin_id: plugin.id.clone(),
                    spec: spec.clone(),
                    plugin_path: plugin.path.clone(),
                })
            })
            .collect();
        Self { jobs }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Jobs that recur, paired with their interval.
    pub fn periodic(&self) -> impl Iterator<Item = (usize, &Job)> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.spec.every.interval().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Write a plugin manifest for tests and fixtures.
#[doc(hidden)]
pub fn write_manifest(dir: &Path, json: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("plugin.json"), json)
}
