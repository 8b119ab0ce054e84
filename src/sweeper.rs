use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Periodic reconciliation of every room, plus optional WAL compaction.
///
/// The first pass runs immediately, so statuses left stale by a restart are
/// corrected before the first interval elapses. Passes never overlap: a slow
/// pass delays the next tick instead of queueing another.
pub struct Sweeper;

impl Sweeper {
    pub fn start(engine: Arc<Engine>, interval: Duration) -> SweeperHandle {
        Self::spawn(engine, interval, None)
    }

    /// Like [`Sweeper::start`], and also compact the WAL once
    /// `compact_threshold` appends have accumulated. `0` disables compaction.
    pub fn start_with_compaction(
        engine: Arc<Engine>,
        interval: Duration,
        compact_threshold: u64,
    ) -> SweeperHandle {
        let threshold = (compact_threshold > 0).then_some(compact_threshold);
        Self::spawn(engine, interval, threshold)
    }

    fn spawn(engine: Arc<Engine>, interval: Duration, compact_threshold: Option<u64>) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(run_sweeper(
            engine.clone(),
            interval,
            cancel.clone(),
        ))];
        if let Some(threshold) = compact_threshold {
            tasks.push(tokio::spawn(run_compactor(
                engine,
                interval,
                threshold,
                cancel.clone(),
            )));
        }
        info!(interval_ms = interval.as_millis() as u64, "sweeper started");
        SweeperHandle { cancel, tasks }
    }
}

/// Owns the background tasks; dropping it leaves them running.
pub struct SweeperHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancel and wait for the tasks. A pass in flight finishes its current
    /// room write first; nothing is left half-applied.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("sweeper task ended abnormally: {e}");
            }
        }
        info!("sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

async fn run_sweeper(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = engine.sweep().await;
        if report.expired > 0 || report.transitions > 0 {
            info!(
                rooms = report.rooms,
                expired = report.expired,
                transitions = report.transitions,
                "sweep"
            );
        }
        if report.failures > 0 {
            warn!(failures = report.failures, "sweep left rooms unreconciled");
        }
    }
}

async fn run_compactor(
    engine: Arc<Engine>,
    period: Duration,
    threshold: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
    debug!("compactor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    const M: Ms = MINUTE_MS;
    /// 2030-01-01T09:00:00Z
    const NINE: Ms = 1_893_488_400_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str, clock: Arc<ManualClock>) -> Arc<Engine> {
        let notify = Arc::new(NotifyHub::new());
        Arc::new(Engine::new(test_wal_path(name), notify, clock).unwrap())
    }

    /// Poll until `check` holds or a generous deadline passes.
    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn sweeper_moves_rooms_through_their_day() {
        let clock = Arc::new(ManualClock::new(NINE));
        let engine = engine("sweeper_day.wal", clock.clone());
        let room = engine
            .create_room("Sala S", 4, RoomStatus::Available)
            .await
            .unwrap();
        let res = engine
            .create_reservation(room.id, "ana", Span::new(NINE + 30 * M, NINE + 60 * M))
            .await
            .unwrap();

        let handle = Sweeper::start(engine.clone(), Duration::from_millis(10));
        assert!(handle.is_running());

        clock.set(NINE + 35 * M);
        assert!(
            eventually(|| engine.get_room(&room.id).unwrap().status == RoomStatus::Occupied).await
        );

        clock.set(NINE + 61 * M);
        assert!(
            eventually(|| {
                !engine.get_reservation(&res.id).unwrap().is_active()
                    && engine.get_room(&room.id).unwrap().status == RoomStatus::Available
            })
            .await
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_halts_reconciliation() {
        let clock = Arc::new(ManualClock::new(NINE));
        let engine = engine("sweeper_stop.wal", clock.clone());
        let room = engine
            .create_room("Sala P", 4, RoomStatus::Available)
            .await
            .unwrap();
        engine
            .create_reservation(room.id, "bia", Span::new(NINE + 30 * M, NINE + 60 * M))
            .await
            .unwrap();

        let handle = Sweeper::start(engine.clone(), Duration::from_millis(10));
        handle.stop().await;

        clock.set(NINE + 35 * M);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            engine.get_room(&room.id).unwrap().status,
            RoomStatus::Available
        );
    }

    #[tokio::test]
    async fn compactor_triggers_at_threshold() {
        let clock = Arc::new(ManualClock::new(NINE));
        let engine = engine("sweeper_compact.wal", clock);
        for i in 0..5 {
            engine
                .create_room(&format!("Sala {i}"), 2, RoomStatus::Available)
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        let handle = Sweeper::start_with_compaction(engine.clone(), Duration::from_millis(10), 3);
        let mut compacted = false;
        for _ in 0..200 {
            if engine.wal_appends_since_compact().await == 0 {
                compacted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert!(compacted);
        assert_eq!(engine.list_rooms().len(), 5);
    }
}
