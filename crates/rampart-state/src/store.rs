//! StateStore — redb-backed state persistence for Rampart.
//!
//! Typed operations over the saved configuration, the discovered instance
//! set, plugin manifests, auxiliary configs, job runs and job cache files.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Every write is retried once when it fails with a transient
//! storage error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableTable};
use tracing::{debug, warn};

use rampart_core::Plugin;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Slot key for the single saved configuration map.
const CONFIG_SLOT: &str = "current";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONFIG).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(PLUGINS).map_err(map_err!(Table))?;
        txn.open_table(CUSTOM_CONFS).map_err(map_err!(Table))?;
        txn.open_table(JOB_RUNS).map_err(map_err!(Table))?;
        txn.open_table(JOB_CACHE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run a write closure, retrying once on a transient storage error.
    fn with_retry<T>(&self, op: impl Fn() -> StateResult<T>) -> StateResult<T> {
        match op() {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient store error, retrying once");
                std::thread::sleep(RETRY_DELAY);
                op()
            }
            other => other,
        }
    }

    // ── Saved configuration ────────────────────────────────────────

    /// Persist the merged configuration map.
    pub fn save_config(&self, config: &BTreeMap<String, String>) -> StateResult<()> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
                table
                    .insert(CONFIG_SLOT, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })?;
        debug!(entries = config.len(), "configuration saved");
        Ok(())
    }

    /// The last saved configuration map, if any.
    pub fn load_config(&self) -> StateResult<Option<BTreeMap<String, String>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIG).map_err(map_err!(Table))?;
        match table.get(CONFIG_SLOT).map_err(map_err!(Read))? {
            Some(guard) => {
                let config =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update one instance.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                table
                    .insert(instance.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// Get an instance by name.
    pub fn get_instance(&self, name: &str) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: Instance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// All known instances, in name order.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let instance: Instance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(instance);
        }
        Ok(results)
    }

    /// Replace the whole instance set in one transaction. The reconciler
    /// calls this after a successful apply so the store never holds a mix
    /// of old and new discoveries.
    pub fn replace_instances(&self, instances: &[Instance]) -> StateResult<()> {
        let mut values = Vec::with_capacity(instances.len());
        for instance in instances {
            values.push((
                instance.name.clone(),
                serde_json::to_vec(instance).map_err(map_err!(Serialize))?,
            ));
        }
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                let stale: Vec<String> = table
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                    .collect();
                for key in &stale {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                for (key, value) in &values {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })?;
        debug!(count = instances.len(), "instance set replaced");
        Ok(())
    }

    // ── Plugins ────────────────────────────────────────────────────

    /// Replace the persisted plugin manifest set.
    pub fn save_plugins(&self, plugins: &[Plugin]) -> StateResult<()> {
        let mut values = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            values.push((
                plugin.id.clone(),
                serde_json::to_vec(plugin).map_err(map_err!(Serialize))?,
            ));
        }
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
                let stale: Vec<String> = table
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                    .collect();
                for key in &stale {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                for (key, value) in &values {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// All persisted plugin manifests, in id order.
    pub fn list_plugins(&self) -> StateResult<Vec<Plugin>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let plugin: Plugin =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(plugin);
        }
        Ok(results)
    }

    // ── Auxiliary configs ──────────────────────────────────────────

    /// Insert or update one auxiliary config.
    pub fn put_custom_conf(&self, conf: &CustomConf) -> StateResult<()> {
        let key = conf.table_key();
        let value = serde_json::to_vec(conf).map_err(map_err!(Serialize))?;
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(CUSTOM_CONFS).map_err(map_err!(Table))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// All auxiliary configs, in key order.
    pub fn list_custom_confs(&self) -> StateResult<Vec<CustomConf>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CUSTOM_CONFS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let conf: CustomConf =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(conf);
        }
        Ok(results)
    }

    /// Replace the whole auxiliary config set in one transaction.
    pub fn replace_custom_confs(&self, confs: &[CustomConf]) -> StateResult<()> {
        let mut values = Vec::with_capacity(confs.len());
        for conf in confs {
            values.push((
                conf.table_key(),
                serde_json::to_vec(conf).map_err(map_err!(Serialize))?,
            ));
        }
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(CUSTOM_CONFS).map_err(map_err!(Table))?;
                let stale: Vec<String> = table
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                    .collect();
                for key in &stale {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                for (key, value) in &values {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    // ── Job runs ───────────────────────────────────────────────────

    /// Record one job execution.
    pub fn record_job_run(&self, run: &JobRun) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(JOB_RUNS).map_err(map_err!(Table))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// Recorded runs for one job, oldest first (key prefix scan).
    pub fn list_job_runs(
        &self,
        plugin_id: &str,
        job_name: &str,
        limit: usize,
    ) -> StateResult<Vec<JobRun>> {
        let prefix = format!("{plugin_id}/{job_name}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let run: JobRun =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(run);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    // ── Job cache ──────────────────────────────────────────────────

    /// Insert or update one cached job file.
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> StateResult<()> {
        let key = entry.table_key();
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(JOB_CACHE).map_err(map_err!(Table))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(())
        })
    }

    /// Get one cached file.
    pub fn get_cache_entry(
        &self,
        plugin_id: &str,
        job_name: &str,
        file_name: &str,
    ) -> StateResult<Option<CacheEntry>> {
        let key = format!("{plugin_id}/{job_name}/{file_name}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_CACHE).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: CacheEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// All cached files, in key order.
    pub fn list_cache_entries(&self) -> StateResult<Vec<CacheEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_CACHE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cached: CacheEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(cached);
        }
        Ok(results)
    }

    /// Delete one cached file. Returns true if it existed.
    pub fn delete_cache_entry(
        &self,
        plugin_id: &str,
        job_name: &str,
        file_name: &str,
    ) -> StateResult<bool> {
        let key = format!("{plugin_id}/{job_name}/{file_name}");
        self.with_retry(|| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            let existed;
            {
                let mut table = txn.open_table(JOB_CACHE).map_err(map_err!(Table))?;
                existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(existed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::hash::sha256_hex;

    fn test_instance(name: &str) -> Instance {
        Instance {
            name: name.to_string(),
            hostname: format!("{name}.internal"),
            health: InstanceHealth::Up,
            env: BTreeMap::new(),
        }
    }

    fn test_conf(conf_type: &str, site: Option<&str>, name: &str, data: &str) -> CustomConf {
        CustomConf {
            conf_type: conf_type.to_string(),
            site: site.map(str::to_string),
            name: name.to_string(),
            data: data.to_string(),
            checksum: sha256_hex(data.as_bytes()),
        }
    }

    // ── Saved configuration ────────────────────────────────────────

    #[test]
    fn config_save_and_load() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_config().unwrap().is_none());

        let mut config = BTreeMap::new();
        config.insert("SERVER_NAME".to_string(), "a.com".to_string());
        store.save_config(&config).unwrap();

        assert_eq!(store.load_config().unwrap(), Some(config));
    }

    #[test]
    fn config_save_overwrites() {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = BTreeMap::new();
        config.insert("USE_FOO".to_string(), "no".to_string());
        store.save_config(&config).unwrap();

        config.insert("USE_FOO".to_string(), "yes".to_string());
        store.save_config(&config).unwrap();

        let loaded = store.load_config().unwrap().unwrap();
        assert_eq!(loaded["USE_FOO"], "yes");
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = test_instance("proxy-1");

        store.put_instance(&instance).unwrap();
        assert_eq!(store.get_instance("proxy-1").unwrap(), Some(instance));
    }

    #[test]
    fn replace_instances_drops_stale_entries() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("old-1")).unwrap();
        store.put_instance(&test_instance("old-2")).unwrap();

        store
            .replace_instances(&[test_instance("new-1")])
            .unwrap();

        let all = store.list_instances().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "new-1");
    }

    // ── Auxiliary configs ──────────────────────────────────────────

    #[test]
    fn custom_conf_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let conf = test_conf("server-http", Some("a.com"), "extra", "# rule");

        store.put_custom_conf(&conf).unwrap();
        let all = store.list_custom_confs().unwrap();
        assert_eq!(all, vec![conf]);
    }

    #[test]
    fn replace_custom_confs_is_atomic_set_swap() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_custom_conf(&test_conf("modsec", None, "old", "x"))
            .unwrap();

        store
            .replace_custom_confs(&[
                test_conf("server-http", Some("a.com"), "one", "1"),
                test_conf("server-http", None, "two", "2"),
            ])
            .unwrap();

        let all = store.list_custom_confs().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.conf_type == "server-http"));
    }

    // ── Job runs ───────────────────────────────────────────────────

    #[test]
    fn job_runs_listed_per_job() {
        let store = StateStore::open_in_memory().unwrap();
        for (started, outcome) in [
            (1000u64, JobOutcome::NoReloadNeeded),
            (2000, JobOutcome::ReloadNeeded),
            (3000, JobOutcome::Failed),
        ] {
            store
                .record_job_run(&JobRun {
                    plugin_id: "blocklist".to_string(),
                    job_name: "download".to_string(),
                    outcome,
                    started_at: started,
                    ended_at: started + 50,
                })
                .unwrap();
        }
        store
            .record_job_run(&JobRun {
                plugin_id: "certs".to_string(),
                job_name: "renew".to_string(),
                outcome: JobOutcome::NoReloadNeeded,
                started_at: 1000,
                ended_at: 1100,
            })
            .unwrap();

        let runs = store.list_job_runs("blocklist", "download", 10).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].outcome, JobOutcome::ReloadNeeded);

        let limited = store.list_job_runs("blocklist", "download", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    // ── Job cache ──────────────────────────────────────────────────

    #[test]
    fn cache_entry_round_trip_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = CacheEntry {
            plugin_id: "blocklist".to_string(),
            job_name: "download".to_string(),
            file_name: "ips.list".to_string(),
            data: b"1.2.3.4\n".to_vec(),
            checksum: sha256_hex(b"1.2.3.4\n"),
            updated_at: 1000,
        };

        store.put_cache_entry(&entry).unwrap();
        assert_eq!(
            store
                .get_cache_entry("blocklist", "download", "ips.list")
                .unwrap(),
            Some(entry)
        );

        assert!(store
            .delete_cache_entry("blocklist", "download", "ips.list")
            .unwrap());
        assert!(!store
            .delete_cache_entry("blocklist", "download", "ips.list")
            .unwrap());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("rampart.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_instance(&test_instance("proxy-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_instance("proxy-1").unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.load_config().unwrap().is_none());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_plugins().unwrap().is_empty());
        assert!(store.list_custom_confs().unwrap().is_empty());
        assert!(store.list_cache_entries().unwrap().is_empty());
        assert!(store.list_job_runs("any", "job", 10).unwrap().is_empty());
    }
}
