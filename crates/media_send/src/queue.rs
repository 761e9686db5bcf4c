//! Sequential, per-room dispatch of staged image messages.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use shared::domain::{DeliveryState, LocalMessageId, RoomId};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{MessageTransport, PendingImageMessage, PipelineEvent};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("message {0} is not in a failed state")]
    NotFailed(LocalMessageId),
}

#[derive(Default)]
struct RoomLane {
    pending: VecDeque<Arc<PendingImageMessage>>,
    draining: bool,
}

/// Single-consumer FIFO per room. Enqueue order is send order: the drain
/// task pops one message, awaits the transport, and only then moves to the
/// next head. At most one drain task runs per room; staging while a drain
/// is in flight only appends to the lane.
pub struct DispatchQueue {
    transport: Arc<dyn MessageTransport>,
    lanes: Mutex<HashMap<RoomId, RoomLane>>,
    failed: Mutex<HashMap<LocalMessageId, Arc<PendingImageMessage>>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl DispatchQueue {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            lanes: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Appends a message to the tail of its room's lane. Does not start a
    /// drain; callers trigger one per batch via [`DispatchQueue::drain`].
    pub async fn enqueue(&self, message: Arc<PendingImageMessage>) {
        let room_id = message.room_id();
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(room_id).or_default();
        lane.pending.push_back(message);
        debug!(
            room_id = room_id.0,
            queued = lane.pending.len(),
            "enqueued image message"
        );
    }

    pub async fn pending_in_room(&self, room_id: RoomId) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.get(&room_id).map_or(0, |lane| lane.pending.len())
    }

    /// Arms the drain task for a room unless one is already running. The
    /// running task picks up everything enqueued behind it, so a second
    /// call during a drain is a no-op.
    pub async fn drain(self: &Arc<Self>, room_id: RoomId) {
        {
            let mut lanes = self.lanes.lock().await;
            let lane = lanes.entry(room_id).or_default();
            if lane.draining || lane.pending.is_empty() {
                return;
            }
            lane.draining = true;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.drain_loop(room_id).await;
        });
    }

    async fn drain_loop(self: Arc<Self>, room_id: RoomId) {
        loop {
            let next = {
                let mut lanes = self.lanes.lock().await;
                let lane = lanes.entry(room_id).or_default();
                match lane.pending.pop_front() {
                    Some(message) => message,
                    None => {
                        lane.draining = false;
                        break;
                    }
                }
            };
            self.deliver(room_id, next).await;
        }
    }

    async fn deliver(&self, room_id: RoomId, message: Arc<PendingImageMessage>) {
        self.transition(&message, DeliveryState::Sending).await;
        match self.transport.send(&message).await {
            Ok(()) => {
                info!(
                    room_id = room_id.0,
                    message_id = %message.id(),
                    "image message delivered"
                );
                self.transition(&message, DeliveryState::Sent).await;
            }
            Err(err) => {
                warn!(
                    room_id = room_id.0,
                    message_id = %message.id(),
                    error = %err,
                    "image message delivery failed; advancing queue"
                );
                self.transition(&message, DeliveryState::Failed).await;
                self.failed
                    .lock()
                    .await
                    .insert(message.id(), Arc::clone(&message));
            }
        }
    }

    async fn transition(&self, message: &PendingImageMessage, state: DeliveryState) {
        message.set_state(state).await;
        let _ = self.events.send(PipelineEvent::DeliveryStateChanged {
            id: message.id(),
            room_id: message.room_id(),
            state,
        });
    }

    /// Puts a failed message back at the tail of its room's lane and kicks
    /// the drain. Only messages currently in `Failed` are retryable.
    pub async fn retry(self: &Arc<Self>, id: LocalMessageId) -> Result<(), RetryError> {
        let message = self
            .failed
            .lock()
            .await
            .remove(&id)
            .ok_or(RetryError::NotFailed(id))?;
        let room_id = message.room_id();
        self.transition(&message, DeliveryState::Pending).await;
        info!(room_id = room_id.0, message_id = %id, "retrying failed image message");
        self.enqueue(message).await;
        self.drain(room_id).await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
