mod error;
mod mutations;
mod queries;
mod reconcile;
mod store;
mod validate;

pub use error::{EngineError, ValidationError};
pub use mutations::{ReservationPatch, RoomUpdate};
pub use reconcile::{reconcile, Reconciliation, SweepReport};
pub use store::{Collection, Document, Store};
pub use validate::validate;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{NotifyHub, Snapshot, Topic};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append(PendingAppend),
    Control(WalControl),
}

/// Commands the writer runs on their own, between append batches.
pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

pub(super) type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// one fsync for the whole batch and answer every sender with its result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append(pending) => pending,
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![first];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append(pending) => batch.push(pending),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes are not
    // carried into the next batch; these callers are told they failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Authoritative owner of rooms, reservations and their reconciliation.
///
/// Every write goes WAL first, then the in-memory store, then the notifier.
/// Writes touching one room's timeline are serialized by that room's lock,
/// which makes check-then-insert atomic and keeps per-room publish order.
pub struct Engine {
    pub store: Store,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    room_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes room create/rename/delete so name uniqueness holds.
    pub(super) catalog: Mutex<()>,
    /// Held shared by every append+apply and exclusively by compaction, so a
    /// compacted snapshot never misses a write that reached the old file.
    commit_gate: RwLock<()>,
    /// Held while a snapshot is built and sent, so subscribers never receive
    /// an older state after a newer one.
    publish_lock: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be
    /// called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for event in &events {
            store.apply_event(event);
        }
        tracing::info!(
            events = events.len(),
            rooms = store.rooms.len(),
            reservations = store.reservations.len(),
            "replayed {}",
            wal_path.display()
        );

        Ok(Self {
            store,
            notify,
            clock,
            wal_tx,
            room_locks: DashMap::new(),
            catalog: Mutex::new(()),
            commit_gate: RwLock::new(()),
            publish_lock: Mutex::new(()),
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append((event.clone(), tx)))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply, publish. A failed append leaves the store untouched.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        {
            let _gate = self.commit_gate.read().await;
            self.wal_append(event).await?;
            self.store.apply_event(event);
        }
        let topic = if event.touches_rooms() {
            Topic::Rooms
        } else {
            Topic::Reservations
        };
        self.publish(topic).await;
        Ok(())
    }

    /// Push the current state of `topic` to its subscribers. Snapshots leave
    /// in the order they were taken.
    pub async fn publish(&self, topic: Topic) {
        let _order = self.publish_lock.lock().await;
        if self.notify.has_subscribers(topic) {
            self.notify.publish(self.snapshot(topic));
        }
    }

    pub fn snapshot(&self, topic: Topic) -> Snapshot {
        match topic {
            Topic::Rooms => Snapshot::Rooms(Arc::new(self.list_rooms())),
            Topic::Reservations => Snapshot::Reservations(Arc::new(self.list_reservations())),
        }
    }

    pub(super) async fn lock_room(&self, room_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.room_locks.entry(room_id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Lock a room that must already exist. Unknown ids never get a lock
    /// entry, and a room deleted while we waited leaves none behind.
    pub(super) async fn lock_existing_room(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        if !self.store.rooms.contains(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        let guard = self.lock_room(room_id).await;
        if !self.store.rooms.contains(&room_id) {
            drop(guard);
            self.forget_room_lock(&room_id);
            return Err(EngineError::NotFound(room_id));
        }
        Ok(guard)
    }

    #[cfg(test)]
    pub(super) fn room_lock_count(&self) -> usize {
        self.room_locks.len()
    }

    /// Lock several rooms in id order so two multi-room writers cannot deadlock.
    pub(super) async fn lock_rooms(&self, mut ids: Vec<Ulid>) -> Vec<OwnedMutexGuard<()>> {
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_room(id).await);
        }
        guards
    }

    pub(super) fn forget_room_lock(&self, room_id: &Ulid) {
        self.room_locks.remove(room_id);
    }

    /// Rewrite the WAL with one record per live document.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.compacted_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(WalControl::Compact {
                events,
                response: tx,
            }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(WalControl::AppendsSinceCompact {
                response: tx,
            }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
