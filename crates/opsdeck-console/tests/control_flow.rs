use futures_util::{SinkExt, StreamExt};
use opsdeck_console::{
    CatalogClient, ChannelEvent, CommandGateway, ConnectionManager, ControlSurface, Notice,
    StartBlocker,
};
use opsdeck_core::RetryPolicy;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Status server that reports the agent as connected and then stays quiet.
async fn status_server() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                let frame = json!({"type": "agent_status", "connected": true}).to_string();
                let _ = ws.send(Message::Text(frame)).await;
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

async fn mount_selection(backend: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/selection"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "id": 7,
                "name_fr": "Lingot de fer",
                "slug_fr": "lingot-de-fer",
                "level": 12,
                "img_blob": "aGVsbG8="
            }]
        })))
        .mount(backend)
        .await;
}

async fn wait_for_agent(surface: &mut ControlSurface, events: &mut mpsc::Receiver<ChannelEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !surface.agent_connected() {
            let event = events.recv().await.expect("channel running");
            surface.apply_channel_event(&event);
        }
    })
    .await
    .expect("agent reported connected");
}

#[tokio::test]
async fn persisted_selection_starts_once_agent_is_connected() {
    let backend = MockServer::start().await;
    mount_selection(&backend).await;
    Mock::given(method("POST"))
        .and(path("/api/cmd"))
        .and(query_param("token", "change-me"))
        .and(body_json(json!({
            "cmd": "start_script",
            "args": {
                "item_ids": [7],
                "items": [{
                    "id": 7,
                    "name_fr": "Lingot de fer",
                    "slug_fr": "lingot-de-fer",
                    "level": 12,
                    "order": 0,
                    "img_blob": "aGVsbG8="
                }]
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&backend)
        .await;

    let backend_url = Url::parse(&backend.uri()).unwrap();
    let catalog = CatalogClient::new(&backend_url);
    let mut surface = ControlSurface::new(
        Arc::new(CommandGateway::new(&backend_url)),
        "change-me",
        Duration::from_secs(15),
    );
    surface.replace_selection(catalog.load_selection().await.expect("selection"));
    assert_eq!(surface.start_blocker(), Some(StartBlocker::AgentDisconnected));

    let manager = ConnectionManager::websocket(status_server().await, RetryPolicy::default());
    let (tx, mut events) = mpsc::channel(16);
    let channel = manager.open("/ws/ui", tx).expect("open");
    wait_for_agent(&mut surface, &mut events).await;
    assert!(surface.can_start());

    let selection_before = surface.selection().clone();
    let notice = surface.start().await.expect("start allowed");
    assert_eq!(
        notice,
        Notice::Succeeded {
            command: "start_script".to_string(),
            payload: json!({"ok": true})
        }
    );
    assert!(surface.in_flight().is_none());
    assert_eq!(surface.selection(), &selection_before);
    assert_eq!(surface.log().len(), 1);

    channel.shutdown().await;
}

#[tokio::test]
async fn rejected_start_surfaces_server_message() {
    let backend = MockServer::start().await;
    mount_selection(&backend).await;
    Mock::given(method("POST"))
        .and(path("/api/cmd"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({"message": "agent busy"})),
        )
        .mount(&backend)
        .await;

    let backend_url = Url::parse(&backend.uri()).unwrap();
    let mut surface = ControlSurface::new(
        Arc::new(CommandGateway::new(&backend_url)),
        "change-me",
        Duration::from_secs(15),
    );
    let items = CatalogClient::new(&backend_url)
        .load_selection()
        .await
        .expect("selection");
    surface.replace_selection(items);

    let manager = ConnectionManager::websocket(status_server().await, RetryPolicy::default());
    let (tx, mut events) = mpsc::channel(16);
    let channel = manager.open("/ws/ui", tx).expect("open");
    wait_for_agent(&mut surface, &mut events).await;

    let notice = surface.start().await.expect("start allowed");
    assert_eq!(
        notice,
        Notice::Failed {
            command: "start_script".to_string(),
            reason: "agent busy".to_string()
        }
    );
    assert!(surface.can_start());
    assert!(surface.agent_connected());

    channel.shutdown().await;
}
