//! The reconcile loop.
//!
//! Idle until a backend event arrives, then collect a full snapshot, diff
//! it against the last applied one and run the apply pipeline when they
//! differ. The last-applied snapshot lives inside the apply mutex so the
//! diff decision and the apply are one critical section: a backend with
//! several event streams still serializes its applies here.
//!
//! A failed apply leaves last-applied untouched. The next event re-derives
//! and re-attempts the same change, so the loop is self-retrying without
//! explicit backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendEvent, BackendResult};
use crate::snapshot::Snapshot;

const BOOTSTRAP_POLL: Duration = Duration::from_secs(5);
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_DEPTH: usize = 16;

/// Everything that happens on a changed snapshot: merge, render, push,
/// reload, persist. Wired up by the daemon.
#[async_trait]
pub trait ApplyPipeline: Send + Sync {
    async fn apply(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

/// Drives one backend against one apply pipeline.
pub struct Reconciler {
    backend: Arc<dyn Backend>,
    pipeline: Arc<dyn ApplyPipeline>,
    /// Last applied snapshot, guarded by the apply lock. `None` until the
    /// bootstrap apply succeeded.
    last_applied: Mutex<Option<Snapshot>>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn Backend>, pipeline: Arc<dyn ApplyPipeline>) -> Self {
        Self {
            backend,
            pipeline,
            last_applied: Mutex::new(None),
        }
    }

    /// Block until the backend and the event loop are done. Performs the
    /// bootstrap barrier and one unconditional apply first; there is no
    /// valid "no instances yet" steady state to reconcile against.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BackendResult<()> {
        if !self.bootstrap(&mut shutdown).await {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let backend = Arc::clone(&self.backend);
        let mut watcher = tokio::spawn(async move {
            loop {
                match backend.watch(tx.clone()).await {
                    Ok(()) => debug!(backend = backend.name(), "event stream ended, restarting"),
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, "event stream failed, restarting");
                    }
                }
                tokio::time::sleep(WATCH_RESTART_DELAY).await;
            }
        });

        info!(backend = self.backend.name(), "entering reconcile loop");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => match event {
                    Some(BackendEvent { stream }) => {
                        debug!(backend = self.backend.name(), stream, "platform event");
                        self.reconcile().await;
                    }
                    None => break,
                },
            }
        }
        watcher.abort();
        let _ = (&mut watcher).await;
        Ok(())
    }

    /// Wait until at least one instance and one site are observable, then
    /// apply once unconditionally. Returns false when shutdown arrived
    /// before the platform produced anything.
    async fn bootstrap(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        info!(
            backend = self.backend.name(),
            "waiting for the platform to expose an instance and a site"
        );
        loop {
            match self.collect().await {
                Ok(snapshot) if snapshot.is_reconcilable() => {
                    let mut last = self.last_applied.lock().await;
                    match self.pipeline.apply(&snapshot).await {
                        Ok(()) => {
                            info!(backend = self.backend.name(), "bootstrap apply succeeded");
                            *last = Some(snapshot);
                            return true;
                        }
                        Err(e) => {
                            error!(backend = self.backend.name(), error = %e, "bootstrap apply failed, retrying");
                        }
                    }
                }
                Ok(_) => {
                    debug!(backend = self.backend.name(), "platform not ready yet");
                }
                Err(e) => {
                    warn!(backend = self.backend.name(), error = %e, "collection failed during bootstrap");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(BOOTSTRAP_POLL) => {}
            }
        }
    }

    /// One pass: collect, diff, apply. Public so tests and the daemon's
    /// boot path can drive it directly.
    pub async fn reconcile(&self) {
        // Held across diff + apply: the comparison is always against the
        // most recently applied snapshot, never a stale one.
        let mut last = self.last_applied.lock().await;

        let snapshot = match self.collect().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "collection failed, keeping previous state");
                return;
            }
        };

        if last.as_ref() == Some(&snapshot) {
            debug!(backend = self.backend.name(), "desired state unchanged");
            return;
        }

        info!(backend = self.backend.name(), "desired state changed, deploying new configuration");
        match self.pipeline.apply(&snapshot).await {
            Ok(()) => {
                info!(backend = self.backend.name(), "new configuration deployed");
                *last = Some(snapshot);
            }
            Err(e) => {
                error!(backend = self.backend.name(), error = %e, "apply failed, keeping previous snapshot");
            }
        }
    }

    /// Re-derive the full desired state from the platform.
    async fn collect(&self) -> BackendResult<Snapshot> {
        let (instances, services, aux_configs) = tokio::try_join!(
            self.backend.list_instances(),
            self.backend.list_services(),
            self.backend.list_aux_configs(),
        )?;
        let mut snapshot = Snapshot {
            instances,
            services,
            aux_configs,
        };
        snapshot.normalize();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::snapshot::ServiceConf;
    use rampart_state::{Instance, InstanceHealth};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend serving a mutable in-memory desired state.
    struct FakeBackend {
        state: std::sync::Mutex<Snapshot>,
    }

    impl FakeBackend {
        fn with_one_site() -> Self {
            let mut settings = BTreeMap::new();
            settings.insert("SERVER_NAME".to_string(), "a.com".to_string());
            Self {
                state: std::sync::Mutex::new(Snapshot {
                    instances: vec![Instance {
                        name: "proxy-1".to_string(),
                        hostname: "proxy-1".to_string(),
                        health: InstanceHealth::Up,
                        env: BTreeMap::new(),
                    }],
                    services: vec![ServiceConf::new(settings)],
                    aux_configs: vec![],
                }),
            }
        }

        fn set_site(&self, name: &str) {
            let mut settings = BTreeMap::new();
            settings.insert("SERVER_NAME".to_string(), name.to_string());
            self.state.lock().unwrap().services = vec![ServiceConf::new(settings)];
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn list_instances(&self) -> BackendResult<Vec<Instance>> {
            Ok(self.state.lock().unwrap().instances.clone())
        }
        async fn list_services(&self) -> BackendResult<Vec<ServiceConf>> {
            Ok(self.state.lock().unwrap().services.clone())
        }
        async fn list_aux_configs(&self) -> BackendResult<Vec<rampart_state::CustomConf>> {
            Ok(self.state.lock().unwrap().aux_configs.clone())
        }
        async fn watch(&self, _tx: mpsc::Sender<BackendEvent>) -> BackendResult<()> {
            Err(BackendError::StreamClosed { stream: "fake" })
        }
    }

    struct CountingPipeline {
        applies: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingPipeline {
        fn new() -> Self {
            Self {
                applies: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ApplyPipeline for CountingPipeline {
        async fn apply(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("render failed");
            }
            Ok(())
        }
    }

    fn reconciler(
        backend: Arc<FakeBackend>,
        pipeline: Arc<CountingPipeline>,
    ) -> Reconciler {
        Reconciler::new(backend, pipeline)
    }

    #[tokio::test]
    async fn equal_snapshots_skip_the_pipeline() {
        let backend = Arc::new(FakeBackend::with_one_site());
        let pipeline = Arc::new(CountingPipeline::new());
        let r = reconciler(Arc::clone(&backend), Arc::clone(&pipeline));

        r.reconcile().await;
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 1);

        backend.set_site("b.com");
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_apply_keeps_last_snapshot_and_retries() {
        let backend = Arc::new(FakeBackend::with_one_site());
        let pipeline = Arc::new(CountingPipeline::new());
        let r = reconciler(Arc::clone(&backend), Arc::clone(&pipeline));

        pipeline.fail.store(true, Ordering::SeqCst);
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 1);

        // Same desired state, but nothing was recorded as applied, so the
        // next wake-up attempts the very same change again.
        pipeline.fail.store(false, Ordering::SeqCst);
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 2);

        // Now it is applied; further wake-ups are no-ops.
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bootstrap_applies_once_unconditionally() {
        let backend = Arc::new(FakeBackend::with_one_site());
        let pipeline = Arc::new(CountingPipeline::new());
        let r = reconciler(Arc::clone(&backend), Arc::clone(&pipeline));

        let (_tx, mut rx) = watch::channel(false);
        assert!(r.bootstrap(&mut rx).await);
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 1);

        // The bootstrap snapshot became last-applied.
        r.reconcile().await;
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bootstrap_stops_on_shutdown_when_platform_is_empty() {
        let backend = Arc::new(FakeBackend {
            state: std::sync::Mutex::new(Snapshot::default()),
        });
        let pipeline = Arc::new(CountingPipeline::new());
        let r = reconciler(backend, Arc::clone(&pipeline));

        let (tx, mut rx) = watch::channel(false);
        let shutdown = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        assert!(!r.bootstrap(&mut rx).await);
        assert_eq!(pipeline.applies.load(Ordering::SeqCst), 0);
        let _ = shutdown.await;
    }
}
