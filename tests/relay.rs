//! End-to-end tests over a real listener and websocket clients.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use roomrelay::{AppState, Config, RoomRegistry, Store};
use serde_json::{json, Value};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    task: JoinHandle<()>,
}

impl Relay {
    async fn start(data_file: &Path) -> Relay {
        let config = Config {
            data_file: data_file.to_owned(),
            send_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        let registry = Arc::new(RoomRegistry::new(Store::load(&config.data_file).await));
        let app = roomrelay::router(AppState {
            registry: Arc::clone(&registry),
            config: Arc::new(config),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Relay { addr, registry, task }
    }

    async fn connect(&self) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/", self.addr))
            .await
            .unwrap();
        client
    }

    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(client: &mut Client) {
    assert!(
        timeout(Duration::from_millis(200), client.next()).await.is_err(),
        "expected no frame"
    );
}

fn join(room_id: &str, password: Option<&str>, create: bool, nick: &str) -> Value {
    let mut payload = json!({
        "roomId": room_id,
        "create": create,
        "userInfo": { "nickName": nick, "avatarUrl": format!("https://example.com/{nick}.png"), "userId": format!("user_{nick}") }
    });
    if let Some(password) = password {
        payload["password"] = json!(password);
    }
    json!({ "type": "join", "payload": payload })
}

fn say(text: &str) -> Value {
    json!({ "type": "message", "payload": { "text": text } })
}

async fn wait_for_members(registry: &RoomRegistry, room_id: &str, count: usize) {
    for _ in 0..100 {
        if registry.member_count(room_id).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{room_id} never reached {count} members");
}

#[tokio::test]
async fn create_join_and_password_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::start(&dir.path().join("chat_data.json")).await;

    let mut first = relay.connect().await;
    send(&mut first, join("测试房间", Some("123"), true, "User1")).await;
    let reply = recv(&mut first).await;
    assert_eq!(reply, json!({ "type": "system", "payload": { "text": "Joined room 测试房间" } }));

    let mut second = relay.connect().await;
    send(&mut second, join("测试房间", None, true, "User2")).await;
    assert_eq!(recv(&mut second).await, json!({ "type": "error", "payload": { "text": "房间已存在" } }));

    let mut third = relay.connect().await;
    send(&mut third, join("不存在的房间", None, false, "User3")).await;
    assert_eq!(recv(&mut third).await, json!({ "type": "error", "payload": { "text": "房间不存在" } }));

    let mut fourth = relay.connect().await;
    send(&mut fourth, join("测试房间", Some("wrong"), false, "User4")).await;
    assert_eq!(recv(&mut fourth).await["payload"]["text"], "密码错误");
    send(&mut fourth, join("测试房间", None, false, "User4")).await;
    assert_eq!(recv(&mut fourth).await["payload"]["text"], "需要密码");
    send(&mut fourth, join("测试房间", Some("123"), false, "User4")).await;
    assert_eq!(recv(&mut fourth).await["type"], "system");

    assert_eq!(relay.registry.member_count("测试房间").await, 2);
    assert_silent(&mut second).await;
    assert_silent(&mut third).await;

    relay.stop().await;
}

#[tokio::test]
async fn broadcast_history_and_leave() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::start(&dir.path().join("chat_data.json")).await;

    let mut clients = Vec::new();
    for (i, nick) in ["ann", "ben", "cat"].into_iter().enumerate() {
        let mut client = relay.connect().await;
        send(&mut client, join("lobby", None, i == 0, nick)).await;
        assert_eq!(recv(&mut client).await["type"], "system");
        clients.push(client);
    }

    send(&mut clients[1], say("hello from ben")).await;
    for client in clients.iter_mut() {
        let frame = recv(client).await;
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["payload"]["text"], "hello from ben");
        assert_eq!(frame["payload"]["sender"]["nickName"], "ben");
        assert_eq!(frame["payload"]["sender"]["userId"], "user_ben");
    }
    for client in clients.iter_mut() {
        assert_silent(client).await;
    }

    send(&mut clients[0], say("second")).await;
    for client in clients.iter_mut() {
        assert_eq!(recv(client).await["payload"]["text"], "second");
    }

    let mut late = relay.connect().await;
    send(&mut late, join("lobby", Some("ignored"), false, "dan")).await;
    let history = recv(&mut late).await;
    assert_eq!(history["type"], "history");
    let texts: Vec<_> = history["payload"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(texts, ["hello from ben", "second"]);
    assert_eq!(recv(&mut late).await["type"], "system");

    let mut cat = clients.pop().unwrap();
    cat.close(None).await.unwrap();
    wait_for_members(&relay.registry, "lobby", 3).await;

    for client in clients.iter_mut().chain(std::iter::once(&mut late)) {
        assert_eq!(recv(client).await["payload"]["text"], "A user left the room");
    }

    send(&mut late, say("after cat left")).await;
    for client in clients.iter_mut().chain(std::iter::once(&mut late)) {
        assert_eq!(recv(client).await["payload"]["text"], "after cat left");
    }

    let snapshot = relay.registry.store().lock().await;
    assert_eq!(snapshot.history("lobby").len(), 3);
    assert_eq!(snapshot.password("lobby"), "");
    drop(snapshot);

    relay.stop().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_keep_connection() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::start(&dir.path().join("chat_data.json")).await;

    let mut client = relay.connect().await;
    client.send(Message::text("{ not json")).await.unwrap();
    send(&mut client, json!({ "type": "typing", "payload": {} })).await;
    send(&mut client, say("nobody hears this")).await;
    send(&mut client, json!({ "type": "join", "payload": { "create": true } })).await;
    assert_silent(&mut client).await;

    send(&mut client, join("still-alive", None, true, "eve")).await;
    assert_eq!(recv(&mut client).await["payload"]["text"], "Joined room still-alive");

    relay.stop().await;
}

#[tokio::test]
async fn rooms_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("chat_data.json");

    let relay = Relay::start(&data_file).await;
    let mut owner = relay.connect().await;
    send(&mut owner, join("测试房间", Some("123"), true, "User1")).await;
    recv(&mut owner).await;
    send(&mut owner, say("before restart")).await;
    recv(&mut owner).await;
    relay.stop().await;

    let relay = Relay::start(&data_file).await;
    assert!(!relay.registry.is_active("测试房间"));

    let mut client = relay.connect().await;
    send(&mut client, join("测试房间", None, true, "User5")).await;
    assert_eq!(recv(&mut client).await["payload"]["text"], "房间已存在");

    send(&mut client, join("测试房间", Some("123"), false, "User5")).await;
    let history = recv(&mut client).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["payload"][0]["text"], "before restart");
    assert_eq!(history["payload"][0]["sender"]["nickName"], "User1");
    assert_eq!(recv(&mut client).await["type"], "system");

    relay.stop().await;
}
