//! End-to-end tests for the client factory and the store contract

use kvsource::{
    create_client, BackendConfig, BackendError, BackendKind, StopSignal, StoreClient,
    WatchOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn file_config(files: Vec<std::path::PathBuf>, filter: &str) -> BackendConfig {
    BackendConfig {
        backend: Some("file".into()),
        files,
        filter: filter.into(),
        poll_interval_ms: 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_env_home() {
    let client = create_client(&BackendConfig::for_kind(BackendKind::Env))
        .await
        .unwrap();
    let values = client.get_values(&["HOME".to_string()]).await.unwrap();

    match std::env::var("HOME") {
        Ok(home) => assert_eq!(values.get("HOME"), Some(&home)),
        Err(_) => assert!(values.is_empty()),
    }
}

#[tokio::test]
async fn test_file_db_host() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("app.yaml");
    std::fs::write(&path, "db:\n  host: 10.0.0.7\n  port: 5432\n").unwrap();

    let client = create_client(&file_config(vec![path], "*.yaml")).await.unwrap();
    let values = client
        .get_values(&["/db/host".to_string(), "/db/missing".to_string()])
        .await
        .unwrap();

    assert_eq!(values.len(), 1);
    assert_eq!(values["/db/host"], "10.0.0.7");
}

#[tokio::test]
async fn test_file_directory_with_filter() {
    let temp = tempdir().unwrap();
    std::fs::write(temp.path().join("a.yaml"), "app:\n  name: svc\n").unwrap();
    std::fs::write(temp.path().join("b.txt"), "app:\n  name: ignored\n").unwrap();

    let client = create_client(&file_config(vec![temp.path().to_path_buf()], "*.yaml"))
        .await
        .unwrap();
    let values = client.get_values(&["/app".to_string()]).await.unwrap();
    assert_eq!(values["/app/name"], "svc");
}

#[tokio::test]
async fn test_bogus_kind() {
    let config = BackendConfig {
        backend: Some("bogus".into()),
        ..Default::default()
    };
    let err = create_client(&config).await.err().unwrap();
    assert!(err.is_config_error());
    assert_eq!(err.to_string(), "Invalid backend: bogus");
}

#[tokio::test]
async fn test_every_kind_is_recognized() {
    for kind in BackendKind::ALL {
        let config = BackendConfig::for_kind(kind);
        // Construction may fail for lack of servers or settings, never on the kind itself.
        if let Err(e) = create_client(&config).await {
            assert!(!matches!(e, BackendError::InvalidBackend(_)), "{}: {}", kind, e);
        }
    }
}

#[tokio::test]
async fn test_vault_token_without_node() {
    let config = BackendConfig {
        backend: Some("vault".into()),
        auth_type: Some("token".into()),
        auth_token: Some("t".into()),
        ..Default::default()
    };
    let err = create_client(&config).await.err().unwrap();
    assert!(err.is_construction_error());
    assert!(err.to_string().contains("no vault address"));
}

#[tokio::test]
async fn test_omitted_kind_equals_etcd() {
    let implicit = create_client(&BackendConfig::default()).await.unwrap();
    let explicit = create_client(&BackendConfig::for_kind(BackendKind::Etcd))
        .await
        .unwrap();
    assert_eq!(implicit.backend_kind(), BackendKind::Etcd);
    assert_eq!(implicit.backend_kind(), explicit.backend_kind());
}

#[tokio::test]
async fn test_empty_keys() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("app.yaml");
    std::fs::write(&path, "a: 1\n").unwrap();

    for config in [
        BackendConfig::for_kind(BackendKind::Env),
        file_config(vec![path], "*"),
        // Never contacted: the empty key set short-circuits.
        BackendConfig::for_kind(BackendKind::Etcd),
    ] {
        let client = create_client(&config).await.unwrap();
        assert!(client.get_values(&[]).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_pre_stopped_watch_returns_promptly() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("app.yaml");
    std::fs::write(&path, "a: 1\n").unwrap();

    let stop = StopSignal::new();
    stop.cancel();

    for config in [
        BackendConfig::for_kind(BackendKind::Env),
        file_config(vec![path], "*"),
        BackendConfig::for_kind(BackendKind::Etcd),
    ] {
        let client = create_client(&config).await.unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            client.watch_prefix("/a", &[], 3, &stop),
        )
        .await
        .expect("watch ignored the stop signal")
        .unwrap();
        assert_eq!(outcome, WatchOutcome::Cancelled);
    }
}

#[tokio::test]
async fn test_concurrent_watches_on_disjoint_prefixes() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("app.yaml");
    std::fs::write(&path, "left:\n  v: 1\nright:\n  v: 1\n").unwrap();

    let client: Arc<dyn StoreClient> =
        Arc::from(create_client(&file_config(vec![path.clone()], "*")).await.unwrap());
    let stop = StopSignal::new();

    let left_index = client
        .watch_prefix("/left", &[], 0, &stop)
        .await
        .unwrap()
        .index()
        .unwrap();
    let right_index = client
        .watch_prefix("/right", &[], 0, &stop)
        .await
        .unwrap()
        .index()
        .unwrap();

    let left = {
        let client = client.clone();
        let stop = stop.clone();
        tokio::spawn(async move { client.watch_prefix("/left", &[], left_index, &stop).await })
    };
    let right = {
        let client = client.clone();
        let stop = stop.clone();
        tokio::spawn(async move { client.watch_prefix("/right", &[], right_index, &stop).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Replace atomically so no poll ever sees a half-written file.
    let staged = temp.path().join("app.yaml.tmp");
    std::fs::write(&staged, "left:\n  v: 2\nright:\n  v: 1\n").unwrap();
    std::fs::rename(&staged, &path).unwrap();

    let left = tokio::time::timeout(Duration::from_secs(5), left)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(left, WatchOutcome::Changed(i) if i != left_index));

    // The untouched prefix keeps waiting until stopped.
    assert!(!right.is_finished());
    stop.cancel();
    let right = right.await.unwrap().unwrap();
    assert_eq!(right, WatchOutcome::Cancelled);
}

#[test]
fn test_toml_without_backend_resolves_to_etcd() {
    let config = BackendConfig::from_toml("nodes = []\n").unwrap();
    assert_eq!(config.kind().unwrap(), BackendKind::Etcd);
    assert_eq!(
        config.nodes_for(BackendKind::Etcd),
        vec!["http://127.0.0.1:2379".to_string()]
    );
}
