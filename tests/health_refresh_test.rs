//! # 健康刷新与封禁复查集成测试

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kmi_rotor::AppConfig;
use kmi_rotor::app::health_refresh::run_cycle;
use kmi_rotor::health::HealthStatus;
use kmi_rotor::key_pool::{KeyRecord, Registry};
use kmi_rotor::proxy::ProxyContext;
use kmi_rotor::scheduler::{is_blocked, mark_blocked};
use kmi_rotor::state::RotationState;

fn context(dir: &TempDir, upstream: &str) -> Arc<ProxyContext> {
    let config = AppConfig {
        upstream_base_url: upstream.to_string(),
        state_dir: dir.path().to_path_buf(),
        dry_run: false,
        usage_cache_seconds: 60,
        blocklist_recheck_seconds: 3600,
        ..AppConfig::default()
    };
    let registry = Registry::from_records([
        KeyRecord::new("alpha", "sk-alpha", 0, false),
        KeyRecord::new("beta", "sk-beta", 0, false),
    ]);
    Arc::new(ProxyContext::new(Arc::new(config), registry, RotationState::default()).unwrap())
}

async fn mount_usage(server: &MockServer, secret: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/usages"))
        .and(header("authorization", format!("Bearer {secret}").as_str()))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn refresh_builds_health_map_and_respects_ttl() {
    let upstream = MockServer::start().await;
    mount_usage(
        &upstream,
        "sk-alpha",
        ResponseTemplate::new(200).set_body_json(json!({"remaining": 25, "total": 100})),
    )
    .await;
    mount_usage(&upstream, "sk-beta", ResponseTemplate::new(500)).await;
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, &upstream.uri());

    assert!(ctx.refresh_health().await.unwrap());
    let map = ctx.health_cache.snapshot().await;
    assert_eq!(map["alpha"].status, HealthStatus::Healthy);
    assert_eq!(map["alpha"].remaining_percent, Some(25.0));
    assert!(map["alpha"].usage_ok);
    assert_eq!(map["beta"].status, HealthStatus::Warn);
    assert!(!map["beta"].usage_ok);
    assert!(ctx.state.lock().await.last_health_refresh.is_some());

    assert!(!ctx.refresh_health().await.unwrap());
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn blocked_key_is_released_after_successful_probe() {
    let upstream = MockServer::start().await;
    mount_usage(
        &upstream,
        "sk-alpha",
        ResponseTemplate::new(200).set_body_json(json!({"remaining_percent": 80})),
    )
    .await;
    mount_usage(&upstream, "sk-beta", ResponseTemplate::new(401)).await;
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, &upstream.uri());
    {
        let mut state = ctx.state.lock().await;
        mark_blocked(&mut state, "alpha", "payment_required", None);
        mark_blocked(&mut state, "beta", "payment_required", None);
    }

    assert_eq!(ctx.recheck_blocked().await.unwrap(), 1);
    {
        let state = ctx.state.lock().await;
        assert!(!is_blocked(&state, "alpha"));
        assert!(is_blocked(&state, "beta"));
    }

    // 间隔内不再探测
    assert_eq!(ctx.recheck_blocked().await.unwrap(), 0);
}

#[tokio::test]
async fn cycle_swallows_upstream_failures() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, "http://127.0.0.1:9");

    run_cycle(&ctx).await;

    let map = ctx.health_cache.snapshot().await;
    assert_eq!(map.len(), 2);
    assert!(map.values().all(|info| !info.usage_ok));
}
