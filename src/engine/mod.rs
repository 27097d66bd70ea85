mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod time;

pub use availability::{business_slots, slot_grid, OPENING_HOUR, SLOTS_PER_DAY, SLOT_MINUTES};
pub use error::EngineError;
pub use mutations::{ReservationRequest, RoomRequest};
pub use time::OfficeClock;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::directory::AdminDirectory;
use crate::model::*;
use crate::notify::{NotifyHub, Outbox};
use crate::store::{NotificationInbox, NotificationSink, ReservationStore, RoomDirectory, WalStore};

/// Everything the engine reads from or writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub rooms: Arc<dyn RoomDirectory>,
    pub reservations: Arc<dyn ReservationStore>,
    pub admins: Arc<dyn AdminDirectory>,
    pub sink: Arc<dyn NotificationSink>,
    pub inbox: Arc<dyn NotificationInbox>,
    /// Live feed of notifications as the sink persists them.
    pub live: Arc<NotifyHub>,
}

impl Collaborators {
    /// Back every store-shaped collaborator with one `WalStore`.
    pub fn from_store(store: Arc<WalStore>, admins: Arc<dyn AdminDirectory>) -> Self {
        Self {
            rooms: store.clone(),
            reservations: store.clone(),
            admins,
            sink: store.clone(),
            live: store.hub().clone(),
            inbox: store,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub clock: OfficeClock,
    pub policy: TransitionPolicy,
}

/// The reservation manager for one office.
pub struct Engine {
    office: String,
    pub(super) collab: Collaborators,
    pub(super) outbox: Outbox,
    pub(super) clock: OfficeClock,
    pub(super) policy: TransitionPolicy,
    /// Held across conflict detection and the write that depends on it.
    room_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    /// Must be called inside a tokio runtime (spawns the notification dispatcher).
    pub fn new(office: impl Into<String>, collab: Collaborators, options: EngineOptions) -> Self {
        let outbox = Outbox::spawn(collab.sink.clone());
        Self {
            office: office.into(),
            collab,
            outbox,
            clock: options.clock,
            policy: options.policy,
            room_locks: DashMap::new(),
        }
    }

    pub fn office(&self) -> &str {
        &self.office
    }

    pub fn clock(&self) -> &OfficeClock {
        &self.clock
    }

    /// Resolve a login name to an identity with its role.
    pub async fn identify(&self, user: &str) -> Result<Identity, EngineError> {
        let role = self.collab.admins.role_of(user).await?;
        Ok(Identity::new(user, role))
    }

    /// Notifications for the caller as they are delivered, until dropped.
    pub fn subscribe_notifications(&self, caller: &Identity) -> broadcast::Receiver<Notification> {
        self.collab.live.subscribe(&caller.user)
    }

    pub(super) async fn lock_room(&self, room_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.room_locks.entry(room_id).or_default().value().clone();
        lock.lock_owned().await
    }
}
