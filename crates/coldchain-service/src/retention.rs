//! Periodic pruning of old readings.
//!
//! When `storage.retention_days` is set, readings older than that many days
//! are deleted at startup and then once per [`PRUNE_INTERVAL`].

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coldchain_store::Store;

/// How often the retention task runs.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Delete readings older than `retention` relative to `now`.
pub async fn prune_once(
    store: &Mutex<Store>,
    retention: Duration,
    now: OffsetDateTime,
) -> coldchain_store::Result<usize> {
    let cutoff = now - retention;
    let store = store.lock().await;
    store.prune_before(cutoff)
}

/// Spawn the retention task. It stops when `cancel` fires.
pub fn spawn(store: Arc<Mutex<Store>>, days: u64, cancel: CancellationToken) -> JoinHandle<()> {
    let retention = Duration::from_secs(days.saturating_mul(86_400));
    info!("Keeping readings for {} day(s)", days);

    tokio::spawn(async move {
        let mut timer = interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            match prune_once(&store, retention, OffsetDateTime::now_utc()).await {
                Ok(removed) => debug!("Retention pass removed {} readings", removed),
                Err(e) => warn!("Failed to prune old readings: {}", e),
            }
        }
        debug!("Retention task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldchain_types::{Reading, SensorKind};
    use time::macros::datetime;

    #[tokio::test]
    async fn test_prune_once_keeps_recent_readings() {
        let store = Mutex::new(Store::open_in_memory().unwrap());
        {
            let store = store.lock().await;
            for (value, at) in [
                (1.0, datetime!(2024-04-01 00:00 UTC)),
                (2.0, datetime!(2024-04-25 00:00 UTC)),
                (3.0, datetime!(2024-04-30 12:00 UTC)),
            ] {
                store
                    .insert_reading(&Reading::new("5", SensorKind::Temperature, value, at))
                    .unwrap();
            }
        }

        let now = datetime!(2024-05-01 00:00 UTC);
        let removed = prune_once(&store, Duration::from_secs(7 * 86_400), now)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.lock().await.count_readings(None).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retention_task_prunes_at_startup_and_stops_on_cancel() {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        store
            .lock()
            .await
            .insert_reading(&Reading::new(
                "5",
                SensorKind::Humidity,
                45.0,
                datetime!(2020-01-01 00:00 UTC),
            ))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = spawn(Arc::clone(&store), 30, cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.lock().await.count_readings(None).unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
