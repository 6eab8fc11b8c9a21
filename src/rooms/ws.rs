use std::{fmt::Display, sync::Arc};

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::{sync::mpsc, time::timeout};
use uuid::Uuid;

use crate::{
    config::Config,
    protocol::{Inbound, JoinPayload, MessagePayload, Outbound},
};

use super::{
    broadcast::{send_to, Outbox},
    registry::{JoinRequest, RoomRegistry},
    ConnId,
};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(registry): State<Arc<RoomRegistry>>,
    State(config): State<Arc<Config>>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| {
        handle_socket(stream, registry, &config).await;
    })
}

async fn handle_socket(stream: WebSocket, registry: Arc<RoomRegistry>, config: &Config) {
    let (sender, receiver) = stream.split();
    serve_connection(sender, receiver, registry, config).await;
}

/// Runs one connection over any websocket-shaped sink and stream until the
/// peer goes away or a write fails, then leaves its room.
async fn serve_connection<W, R, E>(mut sender: W, mut receiver: R, registry: Arc<RoomRegistry>, config: &Config)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (outbox, mut rx) = mpsc::channel::<String>(config.outbox_capacity);
    let mut conn = Connection {
        id: Uuid::now_v7(),
        registry,
        outbox,
        current_room: None,
    };
    let id = conn.id;
    info!("{id} connected");

    let send_timeout = config.send_timeout;

    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match timeout(send_timeout, sender.send(frame.into())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("{id} write failed: {e}");
                    break;
                }
                Err(_) => {
                    warn!("{id} write timed out after {send_timeout:?}");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => conn.dispatch(text.as_str().as_bytes()).await,
                Some(Ok(Message::Binary(data))) => conn.dispatch(&data).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("{id} read failed: {e}");
                    break;
                }
            },
            _ = &mut writer_task => {
                debug!("{id} writer stopped");
                break;
            }
        }
    }

    // the only place the implicit leave happens, once per connection
    conn.disconnect().await;
    writer_task.abort();
    info!("{id} disconnected");
}

/// One client connection and the room it currently occupies.
struct Connection {
    id: ConnId,
    registry: Arc<RoomRegistry>,
    outbox: Outbox,
    current_room: Option<String>,
}

impl Connection {
    async fn disconnect(&mut self) {
        if let Some(room_id) = self.current_room.take() {
            self.registry.leave(self.id, &room_id).await;
        }
    }

    async fn dispatch(&mut self, data: &[u8]) {
        match Inbound::decode(data) {
            Ok(Inbound::Join(payload)) => self.join(payload).await,
            Ok(Inbound::Message(MessagePayload { text })) => self.message(text).await,
            Ok(Inbound::Unknown(kind)) => warn!("{} sent unknown message type {kind:?}", self.id),
            Err(e) => warn!("{} sent undecodable frame: {e}", self.id),
        }
    }

    async fn join(&mut self, payload: JoinPayload) {
        let JoinPayload { room_id, password, create, user_info } = payload;
        let Some(room_id) = room_id.filter(|id| !id.is_empty()) else {
            warn!("{} sent join without a room id", self.id);
            return;
        };

        let request = JoinRequest {
            room_id,
            password: password.unwrap_or_default(),
            create,
            user: user_info,
        };
        let rejoin = self.current_room.as_deref() == Some(request.room_id.as_str());

        match self.registry.join(self.id, &self.outbox, self.current_room.as_deref(), request).await {
            Ok(room_id) => self.current_room = Some(room_id),
            Err(e) => {
                if !rejoin {
                    // the previous room was left before the refusal
                    self.current_room = None;
                }
                info!("{} join refused: {e:?}", self.id);
                let _ = send_to(self.id, &self.outbox, &Outbound::error(e.to_string()));
            }
        }
    }

    async fn message(&mut self, text: String) {
        let Some(room_id) = self.current_room.as_deref() else {
            debug!("{} sent a message outside any room", self.id);
            return;
        };

        self.registry.message(self.id, room_id, text).await;
    }
}
