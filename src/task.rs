//! Timer task serving delayed purge requests and pending hash migrations.

use crate::error::Result;
use crate::journal::Journal;
use crate::pond::Pond;
use crate::region::Region;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Handle to a running purge task. Stopping it (or dropping the handle)
/// cancels the next tick; a batch already in progress finishes first.
pub struct PurgeTask {
    handle: JoinHandle<()>,
}

impl PurgeTask {
    pub fn stop(self) {
        self.handle.abort();
    }

    /// True once the task exited, e.g. after an integrity failure
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PurgeTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One tick of background upkeep: a batch of delayed purges, then a step
/// of any pending hash migration
fn upkeep<R: Region, J: Journal>(pond: &mut Pond<R, J>) -> Result<()> {
    let purged = pond.run_delay_purge()?;
    if purged > 0 {
        debug!(purged, pending = pond.pending_purge(), "delayed purge");
    }
    if pond.hash_migration_pending()? {
        let batch = pond.config().hash_migrate_batch;
        if pond.migrate_hash(batch)? {
            debug!("hash migration completed by purge task");
        }
    }
    Ok(())
}

/// Run [`Pond::run_delay_purge`] and [`Pond::migrate_hash`] every
/// `interval` on the current runtime, usually
/// [`PondConfig::purge_interval`](crate::PondConfig::purge_interval).
///
/// Each tick takes the pond lock for one batch only. The task exits on an
/// integrity error, since continuing would only spread corruption.
pub fn spawn_purge_task<R, J>(pond: Arc<Mutex<Pond<R, J>>>, interval: Duration) -> PurgeTask
where
    R: Region + Send + 'static,
    J: Journal + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut pond = pond.lock().await;
            match upkeep(&mut pond) {
                Ok(()) => {}
                Err(e) if e.is_integrity() => {
                    error!(error = %e, "purge task stopped");
                    break;
                }
                Err(e) => warn!(error = %e, "background upkeep failed"),
            }
        }
    });
    PurgeTask { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PondConfig;
    use crate::hashtable::HashAlgorithm;
    use crate::pond::{PondBuilder, RecordState};
    use crate::region::MemoryRegionBuilder;

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_serves_requests() {
        let region = MemoryRegionBuilder::new().size(2 * 1024 * 1024).build().unwrap();
        let config = PondConfig {
            region_size: 2 * 1024 * 1024,
            delay_purge_batch: 3,
            ..Default::default()
        };
        let interval = config.purge_interval();
        let mut pond = PondBuilder::new().config(config).create(region).unwrap();
        for i in 0..10 {
            pond.insert(format!("k{}", i).as_bytes(), b"v", 1, RecordState::Clean)
                .unwrap();
        }
        pond.delay_purge_notify(7);

        let pond = Arc::new(Mutex::new(pond));
        let task = spawn_purge_task(pond.clone(), interval);
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let pond = pond.lock().await;
            assert_eq!(pond.pending_purge(), 0);
            assert_eq!(pond.total_used_node().unwrap(), 3);
            assert!(pond.contains(b"k9").unwrap());
        }
        assert!(!task.is_finished());
        task.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_task_does_not_run() {
        let region = MemoryRegionBuilder::new().size(2 * 1024 * 1024).build().unwrap();
        let mut pond = PondBuilder::new().create(region).unwrap();
        pond.insert(b"k", b"v", 1, RecordState::Clean).unwrap();

        let pond = Arc::new(Mutex::new(pond));
        let task = spawn_purge_task(pond.clone(), Duration::from_millis(10));
        task.stop();
        pond.lock().await.delay_purge_notify(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pond.lock().await.total_used_node().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_finishes_hash_migration() {
        let region = MemoryRegionBuilder::new().size(2 * 1024 * 1024).build().unwrap();
        let config = PondConfig {
            region_size: 2 * 1024 * 1024,
            hash_buckets: Some(61),
            hash_migrate_batch: 8,
            ..Default::default()
        };
        let interval = config.purge_interval();
        let mut pond = PondBuilder::new().config(config).create(region).unwrap();
        for i in 0..40 {
            pond.insert(format!("k{}", i).as_bytes(), b"v", 1, RecordState::Clean)
                .unwrap();
        }
        assert!(pond.begin_hash_migration(HashAlgorithm::Murmur).unwrap());

        let pond = Arc::new(Mutex::new(pond));
        let task = spawn_purge_task(pond.clone(), interval);
        tokio::time::sleep(interval * 10).await;

        {
            let pond = pond.lock().await;
            assert!(!pond.hash_migration_pending().unwrap());
            assert!(pond.contains(b"k17").unwrap());
            pond.verify().unwrap();
        }
        task.stop();
    }
}
