//! # 服务生命周期集成测试

use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use kmi_rotor::AppConfig;
use kmi_rotor::key_pool::{KeyRecord, Registry};
use kmi_rotor::proxy::{ProxyContext, ProxyServer};
use kmi_rotor::state::{RotationState, StateStore};
use kmi_rotor::trace::{DEFAULT_TRACE_WINDOW, load_trace_entries};

#[tokio::test]
async fn serves_until_shutdown_and_flushes_writers() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig {
        state_dir: dir.path().to_path_buf(),
        dry_run: true,
        usage_cache_seconds: 0,
        blocklist_recheck_seconds: 0,
        ..AppConfig::default()
    };
    let registry = Registry::from_records([KeyRecord::new("alpha", "sk-alpha", 0, false)]);
    let ctx = Arc::new(
        ProxyContext::new(Arc::new(config), registry, RotationState::default()).unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(ProxyServer::new(Arc::clone(&ctx)).serve(listener, async move {
        stop_rx.await.ok();
    }));

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let body: Value = client
            .post(format!("http://{addr}/kmi-rotor/v1/chat/completions"))
            .json(&serde_json::json!({"prompt": "hello there"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["key_label"], "alpha");
    }

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
    assert!(!ctx.state_writer.is_running());

    let traces = load_trace_entries(&ctx.config.trace_path(), DEFAULT_TRACE_WINDOW).unwrap();
    assert_eq!(traces.len(), 3);
    assert!(traces.iter().all(|entry| entry.prompt_head == "hello"));

    let persisted = StateStore::new(ctx.config.state_path())
        .load(&ctx.registry)
        .unwrap();
    assert_eq!(persisted.keys["alpha"].request_count, 3);
}
