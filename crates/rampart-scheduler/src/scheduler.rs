//! The tick loop and coordinated reloads.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Method;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use rampart_api::ApiCaller;
use rampart_core::hash::sha256_hex;
use rampart_state::{CacheEntry, JobOutcome, JobRun, StateStore};

use crate::jobs::{Job, JobTable};

/// Fallback sleep when no periodic job is registered.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Aggregate of one scheduling pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    /// At least one job failed. Sibling jobs still ran.
    pub failed: bool,
    /// At least one job reported a change requiring a reload.
    pub reload_needed: bool,
}

struct Timer {
    job_index: usize,
    next_run: Instant,
}

struct Inner {
    table: JobTable,
    env: BTreeMap<String, String>,
    timers: Vec<Timer>,
}

impl Inner {
    /// Register every periodic job, first due one interval from now.
    fn arm_timers(&mut self) {
        let now = Instant::now();
        self.timers = self
            .table
            .periodic()
            .map(|(job_index, job)| Timer {
                job_index,
                // interval() is Some for everything periodic() yields
                next_run: now + job.spec.every.interval().unwrap_or(IDLE_TICK),
            })
            .collect();
    }
}

pub struct Scheduler {
    plugin_dirs: Vec<PathBuf>,
    cache_dir: PathBuf,
    store: StateStore,
    /// Current fan-out targets; swapped by the daemon whenever the
    /// reconciler discovers a different instance set.
    caller: Mutex<ApiCaller>,
    inner: Mutex<Inner>,
    /// Reload coordination is mutually exclusive with itself.
    reload_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        plugin_dirs: Vec<PathBuf>,
        cache_dir: PathBuf,
        env: BTreeMap<String, String>,
        store: StateStore,
        caller: ApiCaller,
    ) -> Self {
        let (table, plugins) = JobTable::load(&plugin_dirs);
        info!(plugins = plugins.len(), jobs = table.len(), "job table built");
        if let Err(e) = store.save_plugins(&plugins) {
            warn!(error = %e, "failed to persist plugin list");
        }
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!(cache_dir = %cache_dir.display(), error = %e, "failed to create cache dir");
        }
        let mut inner = Inner {
            table,
            env,
            timers: Vec::new(),
        };
        inner.arm_timers();
        Self {
            plugin_dirs,
            cache_dir,
            store,
            caller: Mutex::new(caller),
            inner: Mutex::new(inner),
            reload_lock: Mutex::new(()),
        }
    }

    pub async fn set_caller(&self, caller: ApiCaller) {
        *self.caller.lock().await = caller;
    }

    /// Run every job in the table once. Non-async jobs are serialized
    /// ahead of the async batch so shared remote registrations never race.
    /// Used at boot and after a `reload`.
    pub async fn run_once(&self) -> TickReport {
        let (jobs, env) = {
            let inner = self.inner.lock().await;
            (inner.table.jobs().to_vec(), inner.env.clone())
        };
        info!(jobs = jobs.len(), "running full job pass");
        let mut report = self.run_jobs(&jobs, &env).await;
        if report.reload_needed && !self.coordinated_reload().await {
            report.failed = true;
        }
        report
    }

    /// Drive periodic jobs until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("entering scheduler loop");
        loop {
            let deadline = {
                let inner = self.inner.lock().await;
                inner
                    .timers
                    .iter()
                    .map(|t| t.next_run)
                    .min()
                    .unwrap_or_else(|| Instant::now() + IDLE_TICK)
            };
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep_until(deadline) => self.tick().await,
            }
        }
    }

    /// Swap the job environment, rebuild the table and start over. Called
    /// by the daemon when the merged configuration changed.
    pub async fn reload(&self, new_env: BTreeMap<String, String>) -> TickReport {
        {
            let mut inner = self.inner.lock().await;
            let (table, plugins) = JobTable::load(&self.plugin_dirs);
            info!(jobs = table.len(), "job table rebuilt");
            if let Err(e) = self.store.save_plugins(&plugins) {
                warn!(error = %e, "failed to persist plugin list");
            }
            inner.table = table;
            inner.env = new_env;
            inner.arm_timers();
        }
        self.run_once().await
    }

    /// One pass over the due periodic jobs. A job is re-armed only after
    /// its run completed, so runs of one job never overlap.
    async fn tick(&self) {
        let now = Instant::now();
        let (due, env) = {
            let inner = self.inner.lock().await;
            let due: Vec<(usize, Job)> = inner
                .timers
                .iter()
                .filter(|t| t.next_run <= now)
                .map(|t| (t.job_index, inner.table.jobs()[t.job_index].clone()))
                .collect();
            (due, inner.env.clone())
        };
        if due.is_empty() {
            return;
        }

        let jobs: Vec<Job> = due.iter().map(|(_, job)| job.clone()).collect();
        let mut report = self.run_jobs(&jobs, &env).await;

        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            for (job_index, job) in &due {
                if let Some(timer) = inner.timers.iter_mut().find(|t| t.job_index == *job_index) {
                    timer.next_run = now + job.spec.every.interval().unwrap_or(IDLE_TICK);
                }
            }
        }

        if report.reload_needed && !self.coordinated_reload().await {
            report.failed = true;
        }
        if report.failed {
            warn!("scheduling pass had failures");
        }
    }

    async fn run_jobs(&self, jobs: &[Job], env: &BTreeMap<String, String>) -> TickReport {
        let mut report = TickReport::default();
        let (concurrent, serial): (Vec<&Job>, Vec<&Job>) =
            jobs.iter().partition(|job| job.spec.run_async);

        for job in serial {
            let outcome = self.execute(job, env).await;
            fold(&mut report, outcome);
        }
        let outcomes =
            futures::future::join_all(concurrent.iter().map(|job| self.execute(job, env))).await;
        for outcome in outcomes {
            fold(&mut report, outcome);
        }
        report
    }

    /// Spawn one job process and record the run. Never propagates: a
    /// failing job must not take its siblings down with it.
    async fn execute(&self, job: &Job, env: &BTreeMap<String, String>) -> JobOutcome {
        let job_cache = self.cache_dir.join(&job.plugin_id).join(&job.spec.name);
        if let Err(e) = std::fs::create_dir_all(&job_cache) {
            warn!(job = %job.spec.name, error = %e, "failed to create job cache dir");
        }

        let started_at = now_ms();
        let mut command = Command::new(job.command_path());
        command
            .env_clear()
            .envs(env)
            .env("PLUGIN_ID", &job.plugin_id)
            .env("JOB_NAME", &job.spec.name)
            .env("CACHE_DIR", &job_cache);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let outcome = match command.status().await {
            Ok(status) => match status.code() {
                Some(0) => JobOutcome::NoReloadNeeded,
                Some(1) => JobOutcome::ReloadNeeded,
                _ => JobOutcome::Failed,
            },
            Err(e) => {
                error!(plugin = %job.plugin_id, job = %job.spec.name, error = %e, "failed to spawn job");
                JobOutcome::Failed
            }
        };
        let ended_at = now_ms();
        debug!(plugin = %job.plugin_id, job = %job.spec.name, ?outcome, "job finished");

        if outcome.is_success() {
            self.ingest_cache(job, &job_cache);
        }
        let run = JobRun {
            plugin_id: job.plugin_id.clone(),
            job_name: job.spec.name.clone(),
            outcome,
            started_at,
            ended_at,
        };
        if let Err(e) = self.store.record_job_run(&run) {
            warn!(job = %job.spec.name, error = %e, "failed to record job run");
        }
        outcome
    }

    /// Persist whatever the job left in its cache dir.
    fn ingest_cache(&self, job: &Job, job_cache: &std::path::Path) {
        for entry in WalkDir::new(job_cache).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            let data = match std::fs::read(entry.path()) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "unreadable cache file");
                    continue;
                }
            };
            let cached = CacheEntry {
                plugin_id: job.plugin_id.clone(),
                job_name: job.spec.name.clone(),
                file_name: file_name.to_string(),
                checksum: sha256_hex(&data),
                data,
                updated_at: now_ms(),
            };
            if let Err(e) = self.store.put_cache_entry(&cached) {
                warn!(file = file_name, error = %e, "failed to persist cache entry");
            }
        }
    }

    /// One reload for the whole tick, no matter how many jobs asked. The
    /// cache push happens first; a failed push is logged but never blocks
    /// the reload signal. Returns whether push and reload both succeeded
    /// everywhere.
    async fn coordinated_reload(&self) -> bool {
        let _guard = self.reload_lock.lock().await;
        let caller = self.caller.lock().await.clone();
        if caller.is_empty() {
            debug!("no instances registered, skipping reload");
            return true;
        }

        let pushed = match caller.send_files(&self.cache_dir, "/cache").await {
            Ok(true) => {
                debug!("cache pushed to all instances");
                true
            }
            Ok(false) => {
                warn!("cache push failed on some instances");
                false
            }
            Err(e) => {
                warn!(error = %e, "cache push failed");
                false
            }
        };
        let reloaded = caller.send_to_apis(Method::POST, "/reload", None).await;
        if reloaded {
            info!("fleet reloaded");
        } else {
            error!("reload failed on some instances");
        }
        pushed && reloaded
    }
}

fn fold(report: &mut TickReport, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Failed => report.failed = true,
        JobOutcome::ReloadNeeded => report.reload_needed = true,
        JobOutcome::NoReloadNeeded => {}
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::write_manifest;
    use rampart_api::Api;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn plugin_with_jobs(root: &Path, id: &str, jobs_json: &str) {
        write_manifest(
            &root.join(id),
            &format!(
                r#"{{"id": "{id}", "name": "{id}", "version": "1.0", "jobs": {jobs_json}}}"#
            ),
        )
        .unwrap();
    }

    fn scheduler(root: &Path) -> Scheduler {
        Scheduler::new(
            vec![root.to_path_buf()],
            root.join("cache"),
            BTreeMap::new(),
            StateStore::open_in_memory().unwrap(),
            ApiCaller::default(),
        )
    }

    #[tokio::test]
    async fn exit_codes_map_to_outcomes_and_runs_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "mixed",
            r#"[
                {"name": "ok", "file": "ok.sh", "every": "once", "reload": false},
                {"name": "changed", "file": "changed.sh", "every": "once", "reload": true},
                {"name": "broken", "file": "broken.sh", "every": "once", "reload": false}
            ]"#,
        );
        let jobs = dir.path().join("mixed/jobs");
        write_script(&jobs.join("ok.sh"), "exit 0");
        write_script(&jobs.join("changed.sh"), "exit 1");
        write_script(&jobs.join("broken.sh"), "exit 2");

        let scheduler = scheduler(dir.path());
        let report = scheduler.run_once().await;
        assert!(report.failed);
        assert!(report.reload_needed);

        let run = |name: &str| {
            let runs = scheduler.store.list_job_runs("mixed", name, 10).unwrap();
            assert_eq!(runs.len(), 1);
            runs.into_iter().next().unwrap()
        };
        assert_eq!(run("ok").outcome, JobOutcome::NoReloadNeeded);
        assert_eq!(run("changed").outcome, JobOutcome::ReloadNeeded);
        assert_eq!(run("broken").outcome, JobOutcome::Failed);
        assert!(run("ok").ended_at >= run("ok").started_at);
    }

    #[tokio::test]
    async fn exit_one_requests_a_reload_regardless_of_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "quiet",
            r#"[{"name": "changed", "file": "changed.sh", "every": "once", "reload": false}]"#,
        );
        write_script(&dir.path().join("quiet/jobs/changed.sh"), "exit 1");

        let report = scheduler(dir.path()).run_once().await;
        assert!(!report.failed);
        assert!(report.reload_needed);
    }

    #[tokio::test]
    async fn unreachable_fleet_fails_the_pass_that_needed_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "quiet",
            r#"[{"name": "changed", "file": "changed.sh", "every": "once", "reload": true}]"#,
        );
        write_script(&dir.path().join("quiet/jobs/changed.sh"), "exit 1");

        let api = Api::new("http://127.0.0.1:9", "rampart", None).unwrap();
        let scheduler = Scheduler::new(
            vec![dir.path().to_path_buf()],
            dir.path().join("cache"),
            BTreeMap::new(),
            StateStore::open_in_memory().unwrap(),
            ApiCaller::new(vec![api]),
        );
        let report = scheduler.run_once().await;
        assert!(report.reload_needed);
        assert!(report.failed);
    }

    #[tokio::test]
    async fn missing_executable_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "ghost",
            r#"[{"name": "gone", "file": "gone.sh", "every": "once", "reload": false}]"#,
        );

        let scheduler = scheduler(dir.path());
        let report = scheduler.run_once().await;
        assert!(report.failed);
        let runs = scheduler.store.list_job_runs("ghost", "gone", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn job_output_lands_in_the_cache_table() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "dl",
            r#"[{"name": "fetch", "file": "fetch.sh", "every": "once", "reload": true}]"#,
        );
        write_script(
            &dir.path().join("dl/jobs/fetch.sh"),
            "printf blocked > \"$CACHE_DIR/list.txt\"; exit 1",
        );

        let scheduler = scheduler(dir.path());
        scheduler.run_once().await;

        let entries = scheduler.store.list_cache_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].plugin_id, "dl");
        assert_eq!(entries[0].file_name, "list.txt");
        assert_eq!(entries[0].data, b"blocked");
        assert_eq!(entries[0].checksum, sha256_hex(b"blocked"));
    }

    #[tokio::test]
    async fn job_env_carries_identity_and_merged_settings() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "envdump",
            r#"[{"name": "dump", "file": "dump.sh", "every": "once", "reload": false}]"#,
        );
        write_script(
            &dir.path().join("envdump/jobs/dump.sh"),
            "printf '%s %s %s' \"$PLUGIN_ID\" \"$JOB_NAME\" \"$HTTP_PORT\" > \"$CACHE_DIR/env.txt\"",
        );

        let mut env = BTreeMap::new();
        env.insert("HTTP_PORT".to_string(), "8080".to_string());
        let scheduler = Scheduler::new(
            vec![dir.path().to_path_buf()],
            dir.path().join("cache"),
            env,
            StateStore::open_in_memory().unwrap(),
            ApiCaller::default(),
        );
        scheduler.run_once().await;

        let entries = scheduler.store.list_cache_entries().unwrap();
        assert_eq!(entries[0].data, b"envdump dump 8080");
    }

    #[tokio::test]
    async fn reload_rebuilds_the_table_with_the_new_env() {
        let dir = tempfile::tempdir().unwrap();
        plugin_with_jobs(
            dir.path(),
            "envdump",
            r#"[{"name": "dump", "file": "dump.sh", "every": "once", "reload": false}]"#,
        );
        write_script(
            &dir.path().join("envdump/jobs/dump.sh"),
            "printf '%s' \"$MODE\" > \"$CACHE_DIR/mode.txt\"",
        );

        let scheduler = scheduler(dir.path());
        scheduler.run_once().await;

        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "hardened".to_string());
        let report = scheduler.reload(env).await;
        assert!(!report.failed);

        let entries = scheduler.store.list_cache_entries().unwrap();
        assert_eq!(entries[0].data, b"hardened");
    }
}
