use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Reservation, Room};

const CHANNEL_CAPACITY: usize = 256;

/// A collection subscribers can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Rooms,
    Reservations,
}

impl Topic {
    /// Event name carried on the push stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            Topic::Rooms => "roomsUpdated",
            Topic::Reservations => "reservationsUpdated",
        }
    }
}

/// Full state of one collection right after a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Rooms(Arc<Vec<Room>>),
    Reservations(Arc<Vec<Reservation>>),
}

impl Snapshot {
    pub fn topic(&self) -> Topic {
        match self {
            Snapshot::Rooms(_) => Topic::Rooms,
            Snapshot::Reservations(_) => Topic::Reservations,
        }
    }
}

/// Broadcast hub, one channel per topic.
///
/// Best-effort: there is no backlog, so a new subscriber must pull a full
/// snapshot itself, and a subscriber that falls more than the channel
/// capacity behind skips ahead.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Snapshot>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Snapshot> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Lets publishers skip building a snapshot nobody will read.
    pub fn has_subscribers(&self, topic: Topic) -> bool {
        self.channels
            .get(&topic)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    /// Send a snapshot to its topic. No-op if nobody is listening.
    pub fn publish(&self, snapshot: Snapshot) {
        if let Some(sender) = self.channels.get(&snapshot.topic()) {
            let _ = sender.send(snapshot);
        }
    }

    /// Drop every channel so open subscribers see their stream end.
    /// A later `subscribe` starts a fresh channel.
    pub fn close(&self) {
        self.channels.clear();
    }
}
