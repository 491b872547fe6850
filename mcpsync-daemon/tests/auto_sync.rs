use std::time::Duration;

use mcpsync_core::{AutoSyncSettings, EventCategory, EventKind, ServerConfig, Transport, CONFIG_KEY};
use mcpsync_daemon::{paths, Daemon, DaemonClient, DaemonConfig, ErrorCode, EventStream};
use mcpsync_sync::{file_destination::DEFAULT_SERVERS_KEY, FileDestinationSpec};
use serde_json::Value;
use tempfile::TempDir;

async fn count_sync_starts(events: &mut EventStream, quiet: Duration) -> usize {
    let mut started = 0;
    while let Ok(next) = tokio::time::timeout(quiet, events.next()).await {
        match next.unwrap() {
            Some(event) => {
                if matches!(event.kind, EventKind::SyncStarted { .. }) {
                    started += 1;
                }
            }
            None => break,
        }
    }
    started
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_external_edits_triggers_one_sync() {
    let home = TempDir::new().unwrap();
    let settings = DaemonConfig {
        idle_timeout_ms: Some(0),
        resume_delay_ms: Some(10),
        shutdown_timeout_ms: Some(500),
        ..DaemonConfig::default()
    }
    .apply_defaults(home.path());
    let daemon = Daemon::start(settings).await.unwrap();
    let client = DaemonClient::new(daemon.local_addr().clone()).with_timeout(Duration::from_secs(5));

    let store = daemon.service().store().clone();
    store
        .add_server("files", ServerConfig::new(Transport::stdio("mcp-files-v0")))
        .unwrap();

    let target = home.path().join("editor").join("mcp.json");
    client
        .register_destination(FileDestinationSpec {
            id: "editor".into(),
            path: target.clone(),
            servers_key: DEFAULT_SERVERS_KEY.into(),
            description: None,
        })
        .await
        .unwrap();

    let mut events = client.subscribe(vec![EventCategory::Sync]).await.unwrap();

    let status = client
        .start_auto_sync(Some(AutoSyncSettings {
            enabled: true,
            interval_ms: 0,
            debounce_ms: 300,
            ..AutoSyncSettings::default()
        }))
        .await
        .unwrap();
    assert!(status.running);
    assert!(status.enabled);

    // Edit the config file behind the daemon's back, five times in quick
    // succession.
    let config_file = paths::storage_root(home.path()).join(CONFIG_KEY);
    for version in 1..=5 {
        let mut config = store.get();
        if let Some(server) = config.servers.values_mut().next() {
            server.transport = Transport::stdio(format!("mcp-files-v{version}"));
        }
        std::fs::write(&config_file, serde_yaml::to_string(&config).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.auto_sync_status().await.unwrap().sync_count == 0 {
        assert!(tokio::time::Instant::now() < deadline, "auto-sync never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(count_sync_starts(&mut events, Duration::from_millis(800)).await, 1);
    let status = client.auto_sync_status().await.unwrap();
    assert_eq!(status.sync_count, 1);
    assert!(status.last_sync.is_some());

    let written: Value = serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    assert_eq!(written["mcpServers"]["files"]["command"], "mcp-files-v5");

    let err = client.start_auto_sync(None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    let stopped = client.stop_auto_sync().await.unwrap();
    assert!(!stopped.running);
    assert!(!stopped.enabled);

    drop(events);
    daemon.shutdown().await.unwrap();
}
