//! The apply pipeline: merge → render → persist → distribute.
//!
//! Invoked by the reconciler whenever the desired state changed. The
//! pipeline is all-or-nothing from the reconciler's point of view: any
//! error propagates, last-applied stays untouched and the next platform
//! event retries the same change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tracing::{debug, info, warn};

use rampart_api::{Api, ApiCaller};
use rampart_autoconf::{ApplyPipeline, Snapshot};
use rampart_config::configurator::Configurator;
use rampart_config::schema::Schema;
use rampart_scheduler::Scheduler;
use rampart_state::{InstanceHealth, StateStore};
use rampart_template::templator::Templator;

const READY_POLL: Duration = Duration::from_secs(2);
const READY_RETRIES: u32 = 5;

pub struct PipelineConfig {
    /// Base settings descriptor file.
    pub settings_path: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
    pub templates_dir: PathBuf,
    /// Where the rendered tree is written on this host.
    pub output_dir: PathBuf,
    /// Where the instances mount the tree; rendered paths point here.
    pub target_dir: PathBuf,
    pub api_token: Option<String>,
    pub ignore_regex_check: bool,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: StateStore,
    scheduler: Arc<Scheduler>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: StateStore, scheduler: Arc<Scheduler>) -> Self {
        Self {
            config,
            store,
            scheduler,
        }
    }

    /// Instances worth contacting; the platform already told us the rest
    /// are down.
    fn caller_for(&self, snapshot: &Snapshot) -> anyhow::Result<ApiCaller> {
        let mut apis = Vec::new();
        for instance in &snapshot.instances {
            if instance.health == InstanceHealth::Down {
                debug!(instance = %instance.name, "skipping down instance");
                continue;
            }
            apis.push(Api::from_instance(instance, self.config.api_token.clone())?);
        }
        Ok(ApiCaller::new(apis))
    }
}

#[async_trait]
impl ApplyPipeline for Pipeline {
    async fn apply(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        // 1. Merge the platform's overrides against the full schema.
        let schema = Schema::load(&self.config.settings_path, &self.config.plugin_dirs)?;
        let overrides = snapshot.merged_overrides();
        let merged = Configurator::new(&schema)
            .ignore_regex_check(self.config.ignore_regex_check)
            .merge(&overrides);
        for warning in &merged.warnings {
            warn!(key = %warning.key, reason = %warning.reason, "override rejected");
        }

        // 2. Render the artifact tree from scratch; stale site dirs from a
        // previous apply must not survive.
        match std::fs::remove_dir_all(&self.config.output_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Templator::new(
            &self.config.templates_dir,
            self.config.plugin_dirs.clone(),
            &self.config.output_dir,
            &self.config.target_dir,
            &merged.config,
        )
        .render()?;

        // 3. Drop the auxiliary configs into the rendered tree.
        for conf in &snapshot.aux_configs {
            let mut dir = self.config.output_dir.join(&conf.conf_type);
            if let Some(site) = &conf.site {
                dir = dir.join(site);
            }
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(format!("{}.conf", conf.name)), &conf.data)?;
        }

        // 4. Persist what was applied.
        self.store.save_config(&merged.config)?;
        self.store.replace_instances(&snapshot.instances)?;
        self.store.replace_custom_confs(&snapshot.aux_configs)?;

        // 5. Push the tree and reload the fleet.
        let caller = self.caller_for(snapshot)?;
        if caller.is_empty() {
            debug!("no reachable instance, skipping distribution");
        } else {
            if !caller.wait_ready(READY_POLL, READY_RETRIES).await {
                anyhow::bail!("instances did not become ready");
            }
            let pushed = caller
                .send_files(&self.config.output_dir, "/confs")
                .await?;
            let reloaded = caller.send_to_apis(Method::POST, "/reload", None).await;
            if !(pushed && reloaded) {
                anyhow::bail!("distribution incomplete, will retry on the next event");
            }
        }

        // 6. Hand the merged environment to the scheduler; its jobs see the
        // new settings and run against the new instance set.
        self.scheduler.set_caller(caller).await;
        let report = self.scheduler.reload(merged.config.clone()).await;
        if report.failed {
            warn!("at least one job failed after the apply");
        }

        info!(
            sites = merged.sites.len(),
            instances = snapshot.instances.len(),
            "configuration applied"
        );
        Ok(())
    }
}
