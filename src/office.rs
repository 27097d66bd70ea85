use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::compactor;
use crate::directory::{AdminDirectory, StaticAdminDirectory};
use crate::engine::{Collaborators, Engine, EngineError, EngineOptions, OfficeClock};
use crate::limits::*;
use crate::model::TransitionPolicy;
use crate::notify::NotifyHub;
use crate::store::WalStore;

#[derive(Debug, thiserror::Error)]
pub enum OfficeError {
    #[error("invalid office name: {0}")]
    InvalidName(String),
    #[error("too many offices")]
    TooMany,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What every office is opened with.
#[derive(Debug, Clone)]
pub struct OfficeSettings {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub admins: Vec<String>,
    pub clock: OfficeClock,
    pub policy: TransitionPolicy,
    pub seed_default_room: bool,
    pub max_offices: usize,
}

impl OfficeSettings {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            compact_threshold: 1000,
            admins: vec!["admin".into()],
            clock: OfficeClock::utc(),
            policy: TransitionPolicy::Lenient,
            seed_default_room: true,
            max_offices: MAX_OFFICES,
        }
    }
}

/// Per-office engines. Each office gets its own store, WAL file and
/// compactor; the office is the database name of the pgwire connection.
pub struct OfficeManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Serializes first opens so two connections never replay the same WAL.
    open_lock: Mutex<()>,
    admins: Arc<dyn AdminDirectory>,
    settings: OfficeSettings,
}

impl OfficeManager {
    pub fn new(settings: OfficeSettings) -> Self {
        let admins: Arc<dyn AdminDirectory> = Arc::new(StaticAdminDirectory::new(settings.admins.clone()));
        Self {
            engines: DashMap::new(),
            open_lock: Mutex::new(()),
            admins,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily open the engine for `office`. Names that sanitize to
    /// the same file stem share one engine.
    pub async fn get_or_open(&self, office: &str) -> Result<Arc<Engine>, OfficeError> {
        let office = sanitize(office)?;
        if let Some(engine) = self.engines.get(&office) {
            return Ok(engine.value().clone());
        }

        let _guard = self.open_lock.lock().await;
        if let Some(engine) = self.engines.get(&office) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= self.settings.max_offices {
            return Err(OfficeError::TooMany);
        }

        std::fs::create_dir_all(&self.settings.data_dir)?;
        let wal_path = self.settings.data_dir.join(format!("{office}.wal"));
        let store = Arc::new(WalStore::open(office.as_str(), wal_path, Arc::new(NotifyHub::new()))?);
        let engine = Arc::new(Engine::new(
            office.as_str(),
            Collaborators::from_store(store.clone(), self.admins.clone()),
            EngineOptions {
                clock: self.settings.clock,
                policy: self.settings.policy,
            },
        ));
        if self.settings.seed_default_room {
            engine.ensure_default_room().await?;
        }

        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(store, threshold).await;
        });

        self.engines.insert(office.clone(), engine.clone());
        metrics::gauge!(crate::observability::OFFICES_ACTIVE).set(self.engines.len() as f64);
        info!(%office, "opened office");
        Ok(engine)
    }
}

/// Strip everything but `[A-Za-z0-9_-]` so the name is safe as a file stem.
fn sanitize(office: &str) -> Result<String, OfficeError> {
    if office.len() > MAX_OFFICE_NAME_LEN {
        return Err(OfficeError::InvalidName("office name too long".into()));
    }
    let safe: String = office
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(OfficeError::InvalidName(format!("{office:?}")));
    }
    Ok(safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReservationRequest, RoomRequest};
    use crate::model::{Identity, Role};
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomkeep_test_office").join(format!("{}_{name}", ulid::Ulid::new()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (OfficeManager, PathBuf) {
        let dir = test_data_dir(name);
        (OfficeManager::new(OfficeSettings::new(dir.clone())), dir)
    }

    #[tokio::test]
    async fn offices_are_isolated() {
        let (om, _) = manager("isolation");
        let london = om.get_or_open("london").await.unwrap();
        let paris = om.get_or_open("paris").await.unwrap();

        let room = london.list_rooms().await.unwrap().remove(0);
        let alice = Identity::new("alice", Role::Member);
        london
            .create_reservation(
                &alice,
                ReservationRequest {
                    room_id: Some(room.id),
                    title: Some("Standup".into()),
                    start_time: Some("2025-01-06T10:00:00Z".into()),
                    end_time: Some("2025-01-06T10:30:00Z".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let admin = Identity::new("admin", Role::Admin);
        assert_eq!(london.list_reservations(&admin, None).await.unwrap().len(), 1);
        assert!(paris.list_reservations(&admin, None).await.unwrap().is_empty());
        assert_eq!(room.office, "london");
        assert_eq!(paris.list_rooms().await.unwrap()[0].office, "paris");
    }

    #[tokio::test]
    async fn lazy_open_creates_wal() {
        let (om, dir) = manager("lazy");
        assert!(fs::read_dir(&dir).unwrap().next().is_none());

        om.get_or_open("my_db").await.unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(om.len(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let (om, _) = manager("same_eng");
        let a = om.get_or_open("foo").await.unwrap();
        let b = om.get_or_open("foo").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_first_open_yields_one_engine() {
        let (om, _) = manager("concurrent_open");
        let om = Arc::new(om);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let om = om.clone();
                tokio::spawn(async move { om.get_or_open("hq").await.unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(engines[0].list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn name_sanitized() {
        let (om, dir) = manager("sanitize");
        let evil = om.get_or_open("../evil").await.unwrap();
        assert!(dir.join("evil.wal").exists());
        assert_eq!(evil.office(), "evil");
        assert!(Arc::ptr_eq(&evil, &om.get_or_open("evil").await.unwrap()));

        assert!(matches!(om.get_or_open("../..").await, Err(OfficeError::InvalidName(_))));
    }

    #[tokio::test]
    async fn name_too_long() {
        let (om, _) = manager("name_too_long");
        let err = om.get_or_open(&"x".repeat(MAX_OFFICE_NAME_LEN + 1)).await.err().unwrap();
        assert!(err.to_string().contains("office name too long"));

        om.get_or_open(&"x".repeat(MAX_OFFICE_NAME_LEN)).await.unwrap();
    }

    #[tokio::test]
    async fn office_count_limit() {
        let mut settings = OfficeSettings::new(test_data_dir("count_limit"));
        settings.max_offices = 3;
        let om = OfficeManager::new(settings);
        for i in 0..3 {
            om.get_or_open(&format!("o{i}")).await.unwrap();
        }
        assert!(matches!(om.get_or_open("one_more").await, Err(OfficeError::TooMany)));
    }

    #[tokio::test]
    async fn seeding_can_be_disabled() {
        let dir = test_data_dir("no_seed");
        let mut settings = OfficeSettings::new(dir);
        settings.seed_default_room = false;
        let om = OfficeManager::new(settings);
        let engine = om.get_or_open("bare").await.unwrap();
        assert!(engine.list_rooms().await.unwrap().is_empty());

        let admin = Identity::new("admin", Role::Admin);
        engine
            .create_room(&admin, RoomRequest { name: Some("Atlas".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(engine.list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reopen_replays_office_state() {
        let dir = test_data_dir("reopen");
        let room_id = {
            let om = OfficeManager::new(OfficeSettings::new(dir.clone()));
            let engine = om.get_or_open("hq").await.unwrap();
            engine.list_rooms().await.unwrap()[0].id
        };
        let om = OfficeManager::new(OfficeSettings::new(dir));
        let rooms = om.get_or_open("hq").await.unwrap().list_rooms().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, room_id);
    }
}
