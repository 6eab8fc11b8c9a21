//! Fan-out of encoded frames to room members.
//!
//! Delivery is an enqueue onto each member's bounded outbox; the connection's
//! own writer task performs the (time-bounded) socket write. A member whose
//! outbox is closed or full gets a failed outcome and everyone else is
//! unaffected.

use std::collections::HashMap;

use log::{debug, error, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::ConnId;

/// Sending half of a connection's outbound queue of encoded frames.
pub type Outbox = mpsc::Sender<String>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbox full")]
    Full,
    #[error("frame could not be encoded")]
    Encode,
}

fn encode(event: &impl Serialize) -> Result<String, DeliveryError> {
    serde_json::to_string(event).map_err(|e| {
        error!("failed to encode frame: {e}");
        DeliveryError::Encode
    })
}

pub fn deliver(outbox: &Outbox, frame: String) -> Result<(), DeliveryError> {
    outbox.try_send(frame).map_err(|e| match e {
        TrySendError::Closed(_) => DeliveryError::Closed,
        TrySendError::Full(_) => DeliveryError::Full,
    })
}

/// Encodes and delivers a frame to a single connection.
pub fn send_to(conn: ConnId, outbox: &Outbox, event: &impl Serialize) -> Result<(), DeliveryError> {
    encode(event)
        .and_then(|frame| deliver(outbox, frame))
        .inspect_err(|e| debug!("delivery to {conn} failed: {e}"))
}

/// Per-recipient results of one broadcast.
#[derive(Debug, Default)]
pub struct FanOut {
    pub outcomes: Vec<(ConnId, Result<(), DeliveryError>)>,
}

impl FanOut {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| outcome.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = (ConnId, DeliveryError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|(conn, outcome)| outcome.err().map(|e| (*conn, e)))
    }
}

/// Delivers `event` to every member. The caller holds the room lock, so the
/// member set cannot change while it is walked. A frame that cannot be
/// encoded fails for every member.
pub fn broadcast(members: &HashMap<ConnId, Outbox>, event: &impl Serialize) -> FanOut {
    let frame = encode(event);
    let outcomes = members
        .iter()
        .map(|(conn, outbox)| {
            let outcome = frame.clone().and_then(|frame| deliver(outbox, frame));
            (*conn, outcome)
        })
        .collect();
    let fan_out = FanOut { outcomes };

    for (conn, e) in fan_out.failed() {
        warn!("broadcast to {conn} failed: {e}");
    }

    fan_out
}
