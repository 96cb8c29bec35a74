//! End-to-end apply: a snapshot goes through merge, render, aux-config
//! placement and persistence. Distribution is skipped because every
//! instance in the fixture is down, which is exactly what a pipeline run
//! without reachable proxies should do.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rampart_api::ApiCaller;
use rampart_autoconf::{ApplyPipeline, ServiceConf, Snapshot};
use rampart_core::hash::sha256_hex;
use rampart_scheduler::Scheduler;
use rampart_state::{CustomConf, Instance, InstanceHealth, StateStore};
use rampartd::pipeline::{Pipeline, PipelineConfig};

const SETTINGS: &str = r#"{
    "SERVER_NAME": {"context": "multisite", "default": "www.example.com", "regex": "^[\\w.-]+( [\\w.-]+)*$", "type": "text"},
    "MULTISITE": {"context": "global", "default": "no", "regex": "^(yes|no)$", "type": "check"},
    "HTTP_PORT": {"context": "global", "default": "8080", "regex": "^\\d+$", "type": "text"},
    "USE_GZIP": {"context": "multisite", "default": "no", "regex": "^(yes|no)$", "type": "check"}
}"#;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn fixture(root: &Path) -> (Pipeline, StateStore) {
    write(&root.join("settings.json"), SETTINGS);
    write(
        &root.join("templates/main.conf"),
        "listen {{ HTTP_PORT }};\n",
    );
    write(
        &root.join("templates/server-http/server.conf"),
        "server {{ FIRST_SERVER }} gzip={{ USE_GZIP }}\n",
    );
    std::fs::create_dir_all(root.join("plugins")).unwrap();

    let store = StateStore::open_in_memory().unwrap();
    let scheduler = Arc::new(Scheduler::new(
        vec![root.join("plugins")],
        root.join("cache"),
        BTreeMap::new(),
        store.clone(),
        ApiCaller::default(),
    ));
    let pipeline = Pipeline::new(
        PipelineConfig {
            settings_path: root.join("settings.json"),
            plugin_dirs: vec![root.join("plugins")],
            templates_dir: root.join("templates"),
            output_dir: root.join("output"),
            target_dir: "/etc/rampart".into(),
            api_token: None,
            ignore_regex_check: false,
        },
        store.clone(),
        scheduler,
    );
    (pipeline, store)
}

fn snapshot() -> Snapshot {
    let service = |pairs: &[(&str, &str)]| {
        ServiceConf::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    };
    let mut snapshot = Snapshot {
        instances: vec![Instance {
            name: "proxy-1".to_string(),
            hostname: "proxy-1".to_string(),
            health: InstanceHealth::Down,
            env: [("HTTP_PORT".to_string(), "9000".to_string())].into(),
        }],
        services: vec![
            service(&[("SERVER_NAME", "a.com"), ("USE_GZIP", "yes")]),
            service(&[("SERVER_NAME", "b.com")]),
        ],
        aux_configs: vec![CustomConf {
            conf_type: "server-http".to_string(),
            site: Some("a.com".to_string()),
            name: "extra".to_string(),
            data: "# hand-written\n".to_string(),
            checksum: sha256_hex(b"# hand-written\n"),
        }],
    };
    snapshot.normalize();
    snapshot
}

#[tokio::test]
async fn apply_renders_persists_and_places_aux_configs() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store) = fixture(dir.path());
    let out = dir.path().join("output");

    pipeline.apply(&snapshot()).await.unwrap();

    // Global pass picked up the instance env override.
    assert_eq!(
        std::fs::read_to_string(out.join("main.conf")).unwrap(),
        "listen 9000;\n"
    );

    // Per-site render with each site's own overlay.
    assert_eq!(
        std::fs::read_to_string(out.join("a.com/server-http/server.conf")).unwrap(),
        "server a.com gzip=yes\n"
    );
    assert_eq!(
        std::fs::read_to_string(out.join("b.com/server-http/server.conf")).unwrap(),
        "server b.com gzip=no\n"
    );

    // Auxiliary config dropped into the tree at its scoped path.
    assert_eq!(
        std::fs::read_to_string(out.join("server-http/a.com/extra.conf")).unwrap(),
        "# hand-written\n"
    );

    // Applied state persisted.
    let saved = store.load_config().unwrap().unwrap();
    assert_eq!(saved["HTTP_PORT"], "9000");
    assert_eq!(saved["a.com_USE_GZIP"], "yes");
    assert_eq!(store.list_instances().unwrap().len(), 1);
    assert_eq!(store.list_custom_confs().unwrap().len(), 1);
}

#[tokio::test]
async fn reapply_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _store) = fixture(dir.path());
    let out = dir.path().join("output");
    let snapshot = snapshot();

    pipeline.apply(&snapshot).await.unwrap();
    let first = std::fs::read_to_string(out.join("variables.env")).unwrap();
    pipeline.apply(&snapshot).await.unwrap();
    let second = std::fs::read_to_string(out.join("variables.env")).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn invalid_override_keeps_default_without_failing_the_apply() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, store) = fixture(dir.path());

    let mut snapshot = snapshot();
    snapshot.instances[0]
        .env
        .insert("HTTP_PORT".to_string(), "not-a-port".to_string());

    pipeline.apply(&snapshot).await.unwrap();
    let saved = store.load_config().unwrap().unwrap();
    assert_eq!(saved["HTTP_PORT"], "8080");
}
