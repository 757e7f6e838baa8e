//! End-to-end checks of the telemetry router over real HTTP and WebSocket
//! connections on an ephemeral port.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use lib_common::telemetry::fanout::deliver;
use lib_common::telemetry::{router, AppContext, Engine, EngineConfig, MemoryStore, Reading};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn reading(seq: u64) -> Reading {
    Reading {
        seq,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(seq as i64),
        speed: 80.0 + seq as f64,
        temperature: 20.25 + seq as f64 / 100.0,
        pressure: 100.25 + seq as f64 / 100.0,
    }
}

fn context(config: EngineConfig) -> Arc<AppContext<MemoryStore>> {
    Arc::new(AppContext::new(config, MemoryStore::new()))
}

async fn spawn_server(ctx: &Arc<AppContext<MemoryStore>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(ctx));
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    ws
}

async fn next_reading(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a reading")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_latest_is_no_content_when_empty() {
    let ctx = context(EngineConfig::default());
    let addr = spawn_server(&ctx).await;

    let latest = reqwest::get(format!("http://{}/api/sensors/latest", addr)).await.unwrap();
    assert_eq!(latest.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(latest.bytes().await.unwrap().is_empty());

    let history = reqwest::get(format!("http://{}/api/sensors/history", addr)).await.unwrap();
    assert_eq!(history.status(), reqwest::StatusCode::OK);
    let body: Vec<Value> = history.json().await.unwrap();
    assert!(body.is_empty());

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    ctx.shutdown.cancel();
}

#[tokio::test]
async fn test_latest_and_history_queries() {
    let ctx = context(EngineConfig::default());
    for seq in 1..=12 {
        ctx.store.append(&reading(seq)).await.unwrap();
    }
    let addr = spawn_server(&ctx).await;

    let latest: Value = reqwest::get(format!("http://{}/api/sensors/latest", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["speed"], 92.0);
    assert_eq!(latest["timestamp"], "2024-05-01T12:00:12Z");
    assert!(latest.get("seq").is_none());

    let history: Vec<Value> = reqwest::get(format!("http://{}/api/sensors/history", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let speeds: Vec<f64> = history.iter().map(|r| r["speed"].as_f64().unwrap()).collect();
    let expected: Vec<f64> = (3..=12).map(|seq| 80.0 + seq as f64).collect();
    assert_eq!(speeds, expected);

    ctx.shutdown.cancel();
}

#[tokio::test]
async fn test_subscriber_gets_replay_then_live_in_order() {
    let ctx = context(EngineConfig::default());
    for seq in 1..=3 {
        ctx.store.append(&reading(seq)).await.unwrap();
    }
    let addr = spawn_server(&ctx).await;
    let mut ws = connect(addr).await;

    for seq in 1..=3 {
        assert_eq!(next_reading(&mut ws).await["speed"], 80.0 + seq as f64);
    }

    for seq in 4..=6 {
        let r = reading(seq);
        ctx.store.append(&r).await.unwrap();
        let report = deliver(&ctx.clients, &r).await.unwrap();
        assert_eq!(report.delivered, 1);
    }
    for seq in 4..=6 {
        assert_eq!(next_reading(&mut ws).await["speed"], 80.0 + seq as f64);
    }

    ctx.shutdown.cancel();
}

#[tokio::test]
async fn test_speed_delta_messages_steer_control() {
    let ctx = context(EngineConfig::default());
    let addr = spawn_server(&ctx).await;
    let mut ws = connect(addr).await;
    wait_until(|| ctx.clients.len() == 1).await;

    ws.send(Message::Text(r#"{"type":"speedDelta","value":30}"#.to_string().into()))
        .await
        .unwrap();
    wait_until(|| ctx.control.read() == 125.0).await;

    ws.send(Message::Text(r#"{"type":"unknown","value":-10}"#.to_string().into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"speedDelta","value":-60}"#.to_string().into()))
        .await
        .unwrap();
    wait_until(|| ctx.control.read() == 75.0).await;

    ctx.shutdown.cancel();
}

#[tokio::test]
async fn test_closed_subscriber_is_unregistered() {
    let ctx = context(EngineConfig::default());
    let addr = spawn_server(&ctx).await;

    let mut ws = connect(addr).await;
    let _other = connect(addr).await;
    wait_until(|| ctx.clients.len() == 2).await;

    ws.close(None).await.unwrap();
    wait_until(|| ctx.clients.len() == 1).await;

    ctx.shutdown.cancel();
}

#[tokio::test]
async fn test_engine_streams_generated_readings() {
    let ctx = context(EngineConfig {
        generation_period_ms: 20,
        ..Default::default()
    });
    let addr = spawn_server(&ctx).await;
    let engine = Engine::start(Arc::clone(&ctx)).await.unwrap();
    let mut ws = connect(addr).await;

    let mut previous: Option<String> = None;
    for _ in 0..3 {
        let r = next_reading(&mut ws).await;
        assert_eq!(r["speed"], 100.0);
        let temperature = r["temperature"].as_f64().unwrap();
        assert!((20.44..20.51).contains(&temperature), "{}", temperature);

        let ts = r["timestamp"].as_str().unwrap().to_string();
        if let Some(prev) = &previous {
            let prev = chrono::DateTime::parse_from_rfc3339(prev).unwrap();
            let cur = chrono::DateTime::parse_from_rfc3339(&ts).unwrap();
            assert!(prev < cur);
        }
        previous = Some(ts);
    }

    engine.shutdown().await;
}
