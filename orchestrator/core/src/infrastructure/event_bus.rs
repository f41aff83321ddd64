// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Observation Channel
//
// In-memory pub/sub for `ObservationMessage`s using tokio broadcast
// channels. Producers (supervisor, orchestrator, status tracker) never
// block; a subscriber that falls behind the buffer loses the oldest
// messages and is told how many via `EventBusError::Lagged`.
//
// Nothing is persisted: replay on reconnect is the subscriber's concern.

use crate::domain::events::ObservationMessage;
use crate::domain::worker::WorkerId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to observation messages
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ObservationMessage>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, message: ObservationMessage) {
        metrics::counter!("autobuild_observations_published_total", "type" => message.message_type())
            .increment(1);

        // send() only fails when nobody is subscribed
        if self.sender.send(message).is_err() {
            debug!("No subscribers listening to observation message");
        }
    }

    /// Subscribe to every message
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for one worker's messages
    pub fn subscribe_worker(&self, worker: WorkerId) -> WorkerEventReceiver {
        WorkerEventReceiver {
            receiver: self.sender.subscribe(),
            worker,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} messages", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all observation messages
pub struct EventReceiver {
    receiver: broadcast::Receiver<ObservationMessage>,
}

impl EventReceiver {
    /// Receive the next message (waits until one is available)
    pub async fn recv(&mut self) -> Result<ObservationMessage, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive a message without waiting
    pub fn try_recv(&mut self) -> Result<ObservationMessage, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} messages", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Everything currently buffered, skipping lag notifications.
    pub fn drain(&mut self) -> Vec<ObservationMessage> {
        let mut messages = Vec::new();
        loop {
            match self.try_recv() {
                Ok(message) => messages.push(message),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return messages,
            }
        }
    }
}

/// Receiver for one worker's messages (filtered)
pub struct WorkerEventReceiver {
    receiver: broadcast::Receiver<ObservationMessage>,
    worker: WorkerId,
}

impl WorkerEventReceiver {
    pub async fn recv(&mut self) -> Result<ObservationMessage, EventBusError> {
        loop {
            let message = self.receiver.recv().await.map_err(map_recv_error)?;
            if message.worker() == Some(self.worker) {
                return Ok(message);
            }
        }
    }
}

/// Errors that can occur when receiving messages
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No messages available")]
    Empty,

    #[error("Receiver lagged by {0} messages (messages were dropped)")]
    Lagged(u64),
}
