//! Live-status hub: a registry of connected consumers that receive presence
//! updates.
//!
//! Broadcasting is best-effort. Each consumer has a bounded queue, and a send
//! that cannot complete within the configured timeout is dropped for that
//! consumer only. Consumers whose receiver is gone are unregistered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::debug;
use ws_core::LiveView;

/// Queue depth of each consumer.
pub const CONNECTION_CAPACITY: usize = 64;

/// A message pushed to live consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveMessage {
    /// One employee changed.
    Update { item: LiveView, time: DateTime<Utc> },
    /// Full view of every employee.
    Snapshot {
        items: Vec<LiveView>,
        time: DateTime<Utc>,
    },
}

/// Handle of a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub timed_out: usize,
    pub closed: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    connections: HashMap<ConnectionId, mpsc::Sender<LiveMessage>>,
}

/// Registry of live consumers.
pub struct LiveHub {
    registry: Mutex<Registry>,
    send_timeout: Duration,
}

impl LiveHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            send_timeout,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a consumer and returns its receiving end.
    pub fn add(&self) -> (ConnectionId, mpsc::Receiver<LiveMessage>) {
        let (tx, rx) = mpsc::channel(CONNECTION_CAPACITY);
        let mut registry = self.registry();
        let id = ConnectionId(registry.next_id);
        registry.next_id += 1;
        registry.connections.insert(id, tx);
        debug!(connection = id.0, "live consumer added");
        (id, rx)
    }

    /// Unregisters a consumer; its receiver sees the end of the stream.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.registry().connections.remove(&id).is_some();
        if removed {
            debug!(connection = id.0, "live consumer removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.registry().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends to a single consumer, e.g. the initial snapshot.
    pub async fn send(&self, id: ConnectionId, message: LiveMessage) -> Delivery {
        let sender = self.registry().connections.get(&id).cloned();
        let mut delivery = Delivery::default();
        if let Some(sender) = sender {
            self.deliver(id, &sender, message, &mut delivery).await;
        }
        delivery
    }

    /// Sends `message` to every consumer.
    ///
    /// The lock is held only to copy the sender list, never across a send.
    pub async fn broadcast(&self, message: &LiveMessage) -> Delivery {
        let senders: Vec<_> = self
            .registry()
            .connections
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();
        let mut delivery = Delivery::default();
        for (id, sender) in senders {
            self.deliver(id, &sender, message.clone(), &mut delivery).await;
        }
        delivery
    }

    async fn deliver(
        &self,
        id: ConnectionId,
        sender: &mpsc::Sender<LiveMessage>,
        message: LiveMessage,
        delivery: &mut Delivery,
    ) {
        match sender.send_timeout(message, self.send_timeout).await {
            Ok(()) => delivery.delivered += 1,
            Err(SendTimeoutError::Timeout(_)) => {
                delivery.timed_out += 1;
                debug!(connection = id.0, "live consumer too slow, update dropped");
            }
            Err(SendTimeoutError::Closed(_)) => {
                delivery.closed += 1;
                self.remove(id);
            }
        }
    }
}

/// Appends every message from `rx` to `path` as JSON lines until the hub
/// drops the connection.
pub async fn write_feed(mut rx: mpsc::Receiver<LiveMessage>, path: PathBuf) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open live feed {}", path.display()))?;
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .context("failed to write live feed")?;
    }
    file.flush().await?;
    Ok(())
}
