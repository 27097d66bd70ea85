use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::{StoreError, WalStore};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts an office's WAL once enough appends piled up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!(office = %store.office(), "compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` events were appended since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!(office = %store.office(), appends, "compacted WAL");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRoom;
    use crate::notify::NotifyHub;
    use crate::store::RoomDirectory;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomkeep_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}_{name}", ulid::Ulid::new()))
    }

    fn room(name: &str) -> NewRoom {
        NewRoom {
            name: name.into(),
            office: "hq".into(),
            capacity: 4,
            amenities: vec![],
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = WalStore::open("hq", path.clone(), Arc::new(NotifyHub::new())).unwrap();

        store.create_room(room("Atlas")).await.unwrap();
        store.create_room(room("Borealis")).await.unwrap();
        assert!(!compact_if_needed(&store, 3).await.unwrap());

        store.create_room(room("Cygnus")).await.unwrap();
        assert!(compact_if_needed(&store, 3).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);

        let reopened = WalStore::open("hq", path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(reopened.list_rooms().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn zero_threshold_disables_compaction() {
        let store = WalStore::open("hq", test_wal_path("disabled.wal"), Arc::new(NotifyHub::new())).unwrap();
        store.create_room(room("Atlas")).await.unwrap();
        assert!(!compact_if_needed(&store, 0).await.unwrap());
    }
}
