//! Gateway behavior over real sockets: a controller instance on an
//! ephemeral port, driven by a raw tokio-tungstenite client standing in
//! for an agent.

use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use serde_json::Map;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use taskforge_controller::config::Config;
use taskforge_controller::manager::{RunOptions, TaskManager};
use taskforge_controller::notifier::NoopNotifier;
use taskforge_controller::ratelimit::ConnRateLimiter;
use taskforge_controller::registry::AgentRegistry;
use taskforge_controller::state::AppState;
use taskforge_controller::store::{RunStatus, Store, TaskDraft};
use taskforge_controller::{api, gateway};
use taskforge_protocol::{
    ResultPayload, ResultStatus, WsMessage, CLOSE_IP_REJECTED, CLOSE_SUPERSEDED,
    CLOSE_UNAUTHORIZED, CLOSE_UNKNOWN_AGENT,
};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> Config {
    Config {
        bind: "127.0.0.1:0".parse().unwrap(),
        database: String::new(),
        ip_denylist: Vec::new(),
        allowed_origins: Vec::new(),
        ident_header: None,
        conn_rate_limit: 100,
        conn_rate_window_secs: 60,
        msg_rate_limit: 100,
        webhook_url: None,
    }
}

/// Boots a controller on an ephemeral port with one registered agent
/// (`a1` / `super-secret`, wildcard allow-list unless the config below
/// changes it).
async fn spawn_controller(config: Config, allowed_ips: &[&str]) -> (String, AppState) {
    let store = Store::open_in_memory().await.unwrap();
    let allowed: Vec<String> = allowed_ips.iter().map(|s| s.to_string()).collect();
    store
        .create_agent("a1", "super-secret", &allowed)
        .await
        .unwrap();

    let registry = Arc::new(AgentRegistry::new());
    let manager = TaskManager::new(store.clone(), Arc::clone(&registry), Arc::new(NoopNotifier));
    let conn_limiter = Arc::new(ConnRateLimiter::new(
        config.conn_rate_limit,
        Duration::from_secs(config.conn_rate_window_secs),
    ));
    let state = AppState {
        config: Arc::new(config),
        store,
        registry,
        manager,
        notifier: Arc::new(NoopNotifier),
        conn_limiter,
        shutdown: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/api/agents", get(api::list_agents))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("ws://{addr}/ws"), state)
}

async fn connect_and_init(url: &str, agent_id: &str, token: &str) -> WsClient {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let init = serde_json::to_string(&WsMessage::Init {
        agent_id: agent_id.into(),
        auth_token: token.into(),
    })
    .unwrap();
    ws.send(Message::Text(init.into())).await.unwrap();
    ws
}

/// Reads frames until a close frame arrives; returns its code.
async fn expect_close(ws: &mut WsClient) -> u16 {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("connection ended without close frame: {other:?}"),
        }
    }
}

async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn full_round_trip_over_a_real_socket() {
    let (url, state) = spawn_controller(test_config(), &["*"]).await;
    let mut ws = connect_and_init(&url, "a1", "super-secret").await;

    wait_for(|| state.registry.is_online("a1")).await;

    let task = state
        .store
        .create_task(&TaskDraft {
            name: "roundtrip".into(),
            interpreter: "bash".parse().unwrap(),
            script: "echo hi".into(),
            params: Map::new(),
            agent_id: "a1".into(),
            schedule: None,
            enabled: true,
        })
        .await
        .unwrap();

    let run = state
        .manager
        .run_task(task.id, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    // The agent side receives the dispatch...
    let payload = loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            Message::Text(text) => match serde_json::from_str::<WsMessage>(&text).unwrap() {
                WsMessage::ExecuteTask { payload } => break payload,
                _ => continue,
            },
            _ => continue,
        }
    };
    assert_eq!(payload.run_id, run.id);
    assert_eq!(payload.script, "echo hi");

    // ...and reports a result, which lands in the store.
    let result = WsMessage::TaskResult {
        payload: ResultPayload {
            task_id: payload.task_id,
            run_id: payload.run_id,
            name: payload.name,
            status: ResultStatus::Success,
            exit_code: Some(0),
            stdout: "hi\n".into(),
            stderr: String::new(),
            duration_ms: 12,
        },
    };
    ws.send(Message::Text(serde_json::to_string(&result).unwrap().into()))
        .await
        .unwrap();

    let store = state.store.clone();
    for _ in 0..200 {
        let run = store.find_run(run.id).await.unwrap().unwrap();
        if run.status == RunStatus::Success {
            assert_eq!(run.stdout, "hi\n");
            assert_eq!(run.exit_code, Some(0));
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run never reached success");
}

#[tokio::test]
async fn wrong_token_closes_4002() {
    let (url, _state) = spawn_controller(test_config(), &["*"]).await;
    let mut ws = connect_and_init(&url, "a1", "wrong-token").await;
    assert_eq!(expect_close(&mut ws).await, CLOSE_UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_agent_closes_4004() {
    let (url, _state) = spawn_controller(test_config(), &["*"]).await;
    let mut ws = connect_and_init(&url, "ghost-agent", "super-secret").await;
    assert_eq!(expect_close(&mut ws).await, CLOSE_UNKNOWN_AGENT);
}

#[tokio::test]
async fn peer_outside_allow_list_closes_4003() {
    let (url, _state) = spawn_controller(test_config(), &["203.0.113.0/24"]).await;
    let mut ws = connect_and_init(&url, "a1", "super-secret").await;
    assert_eq!(expect_close(&mut ws).await, CLOSE_IP_REJECTED);
}

#[tokio::test]
async fn empty_allow_list_rejects_all() {
    let (url, _state) = spawn_controller(test_config(), &[]).await;
    let mut ws = connect_and_init(&url, "a1", "super-secret").await;
    assert_eq!(expect_close(&mut ws).await, CLOSE_IP_REJECTED);
}

#[tokio::test]
async fn malformed_first_frame_closes_4001() {
    let (url, _state) = spawn_controller(test_config(), &["*"]).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text("not json at all".into()))
        .await
        .unwrap();
    assert_eq!(expect_close(&mut ws).await, 4001);
}

#[tokio::test]
async fn connection_attempt_rate_limit_refuses_excess() {
    let mut config = test_config();
    config.conn_rate_limit = 2;
    let (url, _state) = spawn_controller(config, &["*"]).await;

    // The first two attempts upgrade fine.
    let _first = connect_async(url.as_str()).await.unwrap();
    let _second = connect_async(url.as_str()).await.unwrap();
    // The third is refused before the upgrade.
    assert!(connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn missing_identification_header_is_refused() {
    let mut config = test_config();
    config.ident_header = Some("x-taskforge-fleet".into());
    let (url, state) = spawn_controller(config, &["*"]).await;

    assert!(connect_async(url.as_str()).await.is_err());

    // With the header present the handshake proceeds normally.
    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-taskforge-fleet", "lab".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    let init = serde_json::to_string(&WsMessage::Init {
        agent_id: "a1".into(),
        auth_token: "super-secret".into(),
    })
    .unwrap();
    ws.send(Message::Text(init.into())).await.unwrap();
    wait_for(|| state.registry.is_online("a1")).await;
}

#[tokio::test]
async fn newer_connection_supersedes_older() {
    let (url, state) = spawn_controller(test_config(), &["*"]).await;

    let mut first = connect_and_init(&url, "a1", "super-secret").await;
    wait_for(|| state.registry.is_online("a1")).await;

    let _second = connect_and_init(&url, "a1", "super-secret").await;
    assert_eq!(expect_close(&mut first).await, CLOSE_SUPERSEDED);

    // The replacement connection keeps the agent online.
    wait_for(|| state.registry.is_online("a1")).await;
    let agent = state.store.find_agent("a1").await.unwrap().unwrap();
    assert!(agent.last_seen_at.is_some());
}

#[tokio::test]
async fn disconnect_marks_agent_offline() {
    let (url, state) = spawn_controller(test_config(), &["*"]).await;
    let ws = connect_and_init(&url, "a1", "super-secret").await;
    wait_for(|| state.registry.is_online("a1")).await;

    drop(ws);
    wait_for(|| !state.registry.is_online("a1")).await;

    let store = state.store.clone();
    for _ in 0..200 {
        let agent = store.find_agent("a1").await.unwrap().unwrap();
        if agent.status == taskforge_controller::store::AgentStatus::Offline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("agent never marked offline");
}

#[tokio::test]
async fn controller_answers_application_pings() {
    let (url, state) = spawn_controller(test_config(), &["*"]).await;
    let mut ws = connect_and_init(&url, "a1", "super-secret").await;
    wait_for(|| state.registry.is_online("a1")).await;

    let ping = serde_json::to_string(&WsMessage::Ping).unwrap();
    ws.send(Message::Text(ping.into())).await.unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for pong")
            .unwrap()
            .unwrap()
        {
            Message::Text(text) => {
                if matches!(serde_json::from_str(&text), Ok(WsMessage::Pong)) {
                    return;
                }
            }
            _ => continue,
        }
    }
}
