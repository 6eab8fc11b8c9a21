//! Active rooms, their members, and the session table.
//!
//! A room "exists" if it is active here or has a trace in the persisted
//! snapshot (a password record or a history entry). Active entries are
//! created on the first successful join and dropped again when the last
//! member leaves; the persisted trace is never removed.
//!
//! Locking: the room map and the session table are plain mutexes that are
//! never held across an await. Each active room has its own async mutex that
//! serializes join/leave/message on that room. The store lock is taken after
//! a room lock, never before one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    protocol::{Message, Outbound, UserInfo},
    store::Store,
};

use super::{
    broadcast::{broadcast, send_to, FanOut, Outbox},
    msg, ConnId,
};

/// Why a join was refused. The display text is what the client is shown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("房间已存在")]
    RoomAlreadyExists,
    #[error("房间不存在")]
    RoomNotFound,
    #[error("需要密码")]
    PasswordRequired,
    #[error("密码错误")]
    PasswordMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: String,
    /// Empty means no password.
    pub password: String,
    pub create: bool,
    pub user: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_id: String,
    pub user: UserInfo,
}

/// Active part of a room. Its password lives in the snapshot.
#[derive(Debug, Default)]
struct Room {
    members: HashMap<ConnId, Outbox>,
    /// Set once the last member left and the entry was unlinked from the map.
    closed: bool,
}

fn check_password(stored: &str, supplied: &str) -> Result<(), JoinError> {
    if stored.is_empty() || stored == supplied {
        Ok(())
    } else if supplied.is_empty() {
        Err(JoinError::PasswordRequired)
    } else {
        Err(JoinError::PasswordMismatch)
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RoomRegistry {
    store: Store,
    rooms: Mutex<HashMap<String, Arc<AsyncMutex<Room>>>>,
    sessions: Mutex<HashMap<ConnId, Session>>,
}

impl RoomRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            rooms: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        locked(&self.rooms).contains_key(room_id)
    }

    /// Number of connections currently in `room_id`.
    pub async fn member_count(&self, room_id: &str) -> usize {
        match self.active_room(room_id) {
            Some(room) => room.lock().await.members.len(),
            None => 0,
        }
    }

    pub fn session(&self, conn: ConnId) -> Option<Session> {
        locked(&self.sessions).get(&conn).cloned()
    }

    fn active_room(&self, room_id: &str) -> Option<Arc<AsyncMutex<Room>>> {
        locked(&self.rooms).get(room_id).cloned()
    }

    fn active_room_or_insert(&self, room_id: &str) -> Arc<AsyncMutex<Room>> {
        locked(&self.rooms)
            .entry(room_id.to_owned())
            .or_insert_with(|| {
                debug!("room {room_id} is active");
                Arc::default()
            })
            .clone()
    }

    /// Joins (or creates) a room, leaving `previous` first when it is a
    /// different room.
    ///
    /// On success the joining connection has been sent the room's history
    /// (if any) followed by a join notice, and the room id is returned as the
    /// connection's new current room. On failure nothing about the requested
    /// room has changed and nothing has been sent. A connection that asks
    /// for the room it is already in keeps its membership when refused.
    pub async fn join(
        &self,
        conn: ConnId,
        outbox: &Outbox,
        previous: Option<&str>,
        request: JoinRequest,
    ) -> Result<String, JoinError> {
        let JoinRequest { room_id, password, create, user } = request;

        if let Some(previous) = previous.filter(|previous| *previous != room_id) {
            self.leave(conn, previous).await;
        }

        {
            let mut snapshot = self.store.lock().await;
            let exists = self.is_active(&room_id) || snapshot.contains_room(&room_id);

            if create {
                if exists {
                    return Err(JoinError::RoomAlreadyExists);
                }
                snapshot.room_passwords.insert(room_id.clone(), password.clone());
                snapshot.history.entry(room_id.clone()).or_default();
                snapshot.persist().await;
                info!("room {room_id} created by {}", user.display_name());
            } else {
                if !exists {
                    return Err(JoinError::RoomNotFound);
                }
                check_password(snapshot.password(&room_id), &password)?;
                if !self.is_active(&room_id) {
                    info!("room {room_id} resurrected");
                }
            }
        }

        loop {
            let room = self.active_room_or_insert(&room_id);
            let mut room = room.lock().await;
            if room.closed {
                // emptied and unlinked while we waited; pick up the fresh entry
                continue;
            }

            room.members.insert(conn, outbox.clone());
            locked(&self.sessions).insert(
                conn,
                Session {
                    room_id: room_id.clone(),
                    user: user.clone(),
                },
            );
            info!("{conn} joined {room_id} as {}", user.display_name());

            let history = self.store.lock().await.history(&room_id).to_vec();
            if !history.is_empty() {
                let _ = send_to(conn, outbox, &Outbound::History(history));
            }
            let _ = send_to(conn, outbox, &Outbound::system(format!("Joined room {room_id}")));

            return Ok(room_id);
        }
    }

    /// Removes `conn` from `room_id`. Returns whether it was a member.
    pub async fn leave(&self, conn: ConnId, room_id: &str) -> bool {
        {
            let mut sessions = locked(&self.sessions);
            if sessions.get(&conn).is_some_and(|s| s.room_id == room_id) {
                sessions.remove(&conn);
            }
        }

        let Some(handle) = self.active_room(room_id) else {
            return false;
        };
        let mut room = handle.lock().await;
        if room.members.remove(&conn).is_none() {
            return false;
        }
        info!("{conn} left {room_id}");

        if room.members.is_empty() {
            room.closed = true;
            let mut rooms = locked(&self.rooms);
            if rooms.get(room_id).is_some_and(|active| Arc::ptr_eq(active, &handle)) {
                rooms.remove(room_id);
            }
            info!("room {room_id} is empty");
        } else {
            broadcast(&room.members, &Outbound::system("A user left the room"));
        }

        true
    }

    /// Records and broadcasts a message from `conn` to `room_id`.
    ///
    /// Returns `None` without side effects unless `conn` is currently a member
    /// of an active `room_id`.
    pub async fn message(&self, conn: ConnId, room_id: &str, text: String) -> Option<FanOut> {
        let room = self.active_room(room_id)?;
        let room = room.lock().await;
        if room.closed || !room.members.contains_key(&conn) {
            return None;
        }

        let sender = match self.session(conn) {
            Some(session) if session.room_id == room_id => session.user,
            _ => UserInfo::unknown(),
        };

        Some(msg::send_msg(&self.store, &room.members, room_id, Message { text, sender }).await)
    }
}
