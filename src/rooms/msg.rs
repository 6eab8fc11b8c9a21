use std::collections::HashMap;

use log::info;

use crate::{
    protocol::{Message, Outbound},
    store::Store,
};

use super::{
    broadcast::{broadcast, FanOut, Outbox},
    ConnId,
};

/// Appends `message` to the room's history, persists the snapshot, then fans
/// it out to `members`. Nothing is broadcast before the append is recorded.
pub(crate) async fn send_msg(
    store: &Store,
    members: &HashMap<ConnId, Outbox>,

    room_id: &str,
    message: Message,
) -> FanOut {
    info!("message in {room_id} from {}: {}", message.sender.display_name(), message.text);

    {
        let mut snapshot = store.lock().await;
        snapshot.append(room_id, message.clone());
        snapshot.persist().await;
    }

    broadcast(members, &Outbound::Message(message))
}
