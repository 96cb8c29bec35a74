//! rampartd — the Rampart daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Fleet state reconciler (one platform backend)
//! - Apply pipeline (merge → render → persist → distribute)
//! - Job scheduler
//!
//! # Usage
//!
//! ```text
//! rampartd --data-dir /var/lib/rampart standalone --env-file /etc/rampart/variables.env
//! rampartd docker --docker-host tcp://10.0.0.2:2375
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use rampart_api::ApiCaller;
use rampart_autoconf::{
    docker::DockerBackend, kubernetes::KubernetesBackend, standalone::StandaloneBackend,
    swarm::SwarmBackend, Backend, Reconciler,
};
use rampart_scheduler::Scheduler;
use rampart_state::StateStore;
use rampartd::pipeline::{Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "rampartd", about = "Rampart configuration control plane")]
struct Cli {
    /// Data directory for persistent state and the job cache.
    #[arg(long, default_value = "/var/lib/rampart")]
    data_dir: PathBuf,

    /// Base settings descriptor file.
    #[arg(long, default_value = "/usr/share/rampart/settings.json")]
    settings: PathBuf,

    /// Plugin directories (repeatable).
    #[arg(long = "plugins", default_value = "/usr/share/rampart/plugins")]
    plugin_dirs: Vec<PathBuf>,

    /// Core template directory.
    #[arg(long, default_value = "/usr/share/rampart/templates")]
    templates: PathBuf,

    /// Where the rendered tree is written.
    #[arg(long, default_value = "/var/cache/rampart/output")]
    output: PathBuf,

    /// Where the instances mount the rendered tree.
    #[arg(long, default_value = "/etc/rampart")]
    target: PathBuf,

    /// Bearer token for the instance APIs.
    #[arg(long, env = "API_TOKEN")]
    api_token: Option<String>,

    /// Skip per-setting pattern validation (debugging only).
    #[arg(long)]
    ignore_regex_check: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a local environment file and configs directory.
    Standalone {
        #[arg(long, default_value = "/etc/rampart/variables.env")]
        env_file: PathBuf,

        #[arg(long, default_value = "/etc/rampart/configs")]
        configs_dir: PathBuf,
    },
    /// Watch containers on one docker engine.
    Docker {
        #[arg(long, env = "DOCKER_HOST", default_value = "tcp://127.0.0.1:2375")]
        docker_host: String,
    },
    /// Watch services and config objects on a swarm manager.
    Swarm {
        #[arg(long, env = "DOCKER_HOST", default_value = "tcp://127.0.0.1:2375")]
        docker_host: String,
    },
    /// Watch pods, ingresses and configmaps through the in-cluster API.
    Kubernetes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rampartd=debug,rampart=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let backend: Arc<dyn Backend> = match &cli.command {
        Command::Standalone {
            env_file,
            configs_dir,
        } => Arc::new(StandaloneBackend::new(env_file, configs_dir)),
        Command::Docker { docker_host } => Arc::new(DockerBackend::new(docker_host)?),
        Command::Swarm { docker_host } => Arc::new(SwarmBackend::new(docker_host)?),
        Command::Kubernetes => Arc::new(KubernetesBackend::in_cluster()?),
    };
    info!(backend = backend.name(), "rampart daemon starting");

    std::fs::create_dir_all(&cli.data_dir)?;
    let store = StateStore::open(&cli.data_dir.join("rampart.redb"))?;
    info!(data_dir = %cli.data_dir.display(), "state store opened");

    let scheduler = Arc::new(Scheduler::new(
        cli.plugin_dirs.clone(),
        cli.data_dir.join("cache"),
        Default::default(),
        store.clone(),
        ApiCaller::default(),
    ));

    let pipeline = Pipeline::new(
        PipelineConfig {
            settings_path: cli.settings.clone(),
            plugin_dirs: cli.plugin_dirs.clone(),
            templates_dir: cli.templates.clone(),
            output_dir: cli.output.clone(),
            target_dir: cli.target.clone(),
            api_token: cli.api_token.clone(),
            ignore_regex_check: cli.ignore_regex_check,
        },
        store.clone(),
        Arc::clone(&scheduler),
    );
    let reconciler = Arc::new(Reconciler::new(backend, Arc::new(pipeline)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_task = {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.run(shutdown).await {
                error!(error = %e, "reconciler stopped");
            }
        })
    };
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown).await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconciler_task.await;
    let _ = scheduler_task.await;

    info!("rampart daemon stopped");
    Ok(())
}
