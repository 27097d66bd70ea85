use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::{
    NotificationInbox, NotificationSink, ReservationFilter, ReservationStore, RoomDirectory,
    StoreError,
};

type SharedLedger = Arc<RwLock<RoomLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then
/// flush + fsync once and answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply a reservation event to its room's ledger (caller holds the lock).
fn apply_to_ledger(ledger: &mut RoomLedger, event: &Event) {
    match event {
        Event::ReservationCreated { reservation } => ledger.insert(reservation.clone()),
        Event::ReservationStatusChanged {
            id,
            status,
            updated_at,
            ..
        } => {
            if let Some(r) = ledger.get_mut(*id) {
                r.status = *status;
                r.updated_at = *updated_at;
            }
        }
        Event::RoomCreated { .. }
        | Event::NotificationCreated { .. }
        | Event::NotificationRead { .. } => {}
    }
}

fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { reservation } => Some(reservation.room_id),
        Event::ReservationStatusChanged { room_id, .. } => Some(*room_id),
        Event::RoomCreated { .. }
        | Event::NotificationCreated { .. }
        | Event::NotificationRead { .. } => None,
    }
}

/// Rooms, reservations and notifications of one office, held in memory and
/// made durable through a group-commit WAL.
pub struct WalStore {
    office: String,
    rooms: DashMap<Ulid, Room>,
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: reservation id → room id
    reservation_to_room: DashMap<Ulid, Ulid>,
    notifications: DashMap<Ulid, Notification>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every write, exclusive while compacting, so a snapshot
    /// never misses an in-flight append.
    write_gate: RwLock<()>,
    hub: Arc<NotifyHub>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(office: impl Into<String>, wal_path: PathBuf, hub: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            office: office.into(),
            rooms: DashMap::new(),
            ledgers: DashMap::new(),
            reservation_to_room: DashMap::new(),
            notifications: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            hub,
        };

        // Ledgers are built unshared first, then wrapped, so replay never
        // touches a lock.
        let mut ledgers: HashMap<Ulid, RoomLedger> = HashMap::new();
        for event in &events {
            store.apply_index(event);
            if let Some(room_id) = event_room_id(event) {
                apply_to_ledger(ledgers.entry(room_id).or_default(), event);
            }
        }
        for (room_id, ledger) in ledgers {
            store.ledgers.insert(room_id, Arc::new(RwLock::new(ledger)));
        }

        tracing::debug!(office = %store.office, events = events.len(), "store replayed");
        Ok(store)
    }

    pub fn office(&self) -> &str {
        &self.office
    }

    pub fn hub(&self) -> &Arc<NotifyHub> {
        &self.hub
    }

    /// Apply the non-ledger part of an event.
    fn apply_index(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } => {
                self.rooms.insert(room.id, room.clone());
            }
            Event::ReservationCreated { reservation } => {
                self.reservation_to_room.insert(reservation.id, reservation.room_id);
            }
            Event::ReservationStatusChanged { .. } => {}
            Event::NotificationCreated { notification } => {
                self.notifications.insert(notification.id, notification.clone());
            }
            Event::NotificationRead { id } => {
                if let Some(mut n) = self.notifications.get_mut(id) {
                    n.is_read = true;
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn ledger(&self, room_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomLedger::new())))
            .value()
            .clone()
    }

    fn existing_ledger(&self, room_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(room_id).map(|e| e.value().clone())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;

        let mut rooms: Vec<Room> = self.rooms.iter().map(|e| e.value().clone()).collect();
        rooms.sort_by_key(|r| (r.created_at, r.id));
        let mut events: Vec<Event> = rooms.into_iter().map(|room| Event::RoomCreated { room }).collect();

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(
                guard
                    .reservations
                    .iter()
                    .cloned()
                    .map(|reservation| Event::ReservationCreated { reservation }),
            );
        }

        let mut notifications: Vec<Notification> =
            self.notifications.iter().map(|e| e.value().clone()).collect();
        notifications.sort_by_key(|n| (n.created_at, n.id));
        events.extend(
            notifications
                .into_iter()
                .map(|notification| Event::NotificationCreated { notification }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl RoomDirectory for WalStore {
    async fn find_room(&self, id: Ulid) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&id).map(|e| e.value().clone()))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self
            .rooms
            .iter()
            .filter(|e| e.value().is_active)
            .map(|e| e.value().clone())
            .collect();
        rooms.sort_by_key(|r| (r.created_at, r.id));
        Ok(rooms)
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError> {
        let _gate = self.write_gate.read().await;
        let room = Room {
            id: Ulid::new(),
            name: room.name,
            office: room.office,
            capacity: room.capacity,
            amenities: room.amenities,
            is_active: true,
            created_at: now_ms(),
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.apply_index(&event);
        Ok(room)
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn find(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError> {
        let ledgers: Vec<SharedLedger> = match filter.room {
            Some(room) => self.existing_ledger(&room).into_iter().collect(),
            None => self.ledgers.iter().map(|e| e.value().clone()).collect(),
        };
        let upper = filter.start_upper_bound();

        let mut found = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            let candidates = match upper {
                Some(bound) => guard.starting_before(bound),
                None => &guard.reservations[..],
            };
            found.extend(candidates.iter().filter(|r| filter.matches(r)).cloned());
        }
        found.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(room_id) = self.reservation_to_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.existing_ledger(&room_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn create(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let _gate = self.write_gate.read().await;
        let now = now_ms();
        let reservation = Reservation {
            id: Ulid::new(),
            room_id: new.room_id,
            user: new.user,
            office: new.office,
            title: new.title,
            description: new.description,
            attendees: new.attendees,
            span: new.span,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let ledger = self.ledger(reservation.room_id);
        let mut guard = ledger.write().await;
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_index(&event);
        apply_to_ledger(&mut guard, &event);
        Ok(reservation)
    }

    async fn update(&self, id: Ulid, patch: ReservationPatch) -> Result<Option<Reservation>, StoreError> {
        let _gate = self.write_gate.read().await;
        let Some(room_id) = self.reservation_to_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let ledger = self.ledger(room_id);
        let mut guard = ledger.write().await;
        let Some(current) = guard.get(id).cloned() else {
            return Ok(None);
        };
        let Some(status) = patch.status else {
            return Ok(Some(current));
        };

        let event = Event::ReservationStatusChanged {
            id,
            room_id,
            status,
            updated_at: now_ms(),
        };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        Ok(guard.get(id).cloned())
    }
}

#[async_trait]
impl NotificationSink for WalStore {
    async fn emit(&self, outbound: OutboundNotification) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        let notification = Notification {
            id: Ulid::new(),
            user: outbound.user,
            message: outbound.message,
            kind: outbound.kind,
            is_read: false,
            created_at: now_ms(),
        };
        let event = Event::NotificationCreated {
            notification: notification.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_index(&event);
        self.hub.send(&notification);
        Ok(())
    }
}

#[async_trait]
impl NotificationInbox for WalStore {
    async fn list_for(&self, user: &str) -> Result<Vec<Notification>, StoreError> {
        let mut mine: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|e| e.value().user == user)
            .map(|e| e.value().clone())
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(mine)
    }

    async fn mark_read(&self, user: &str, id: Ulid) -> Result<Option<Notification>, StoreError> {
        let _gate = self.write_gate.read().await;
        let current = match self.notifications.get(&id) {
            Some(e) if e.value().user == user => e.value().clone(),
            _ => return Ok(None),
        };
        if current.is_read {
            return Ok(Some(current));
        }
        let event = Event::NotificationRead { id };
        self.wal_append(&event).await?;
        self.apply_index(&event);
        Ok(self.notifications.get(&id).map(|e| e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TimeBound;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomkeep_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}_{name}", Ulid::new()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(path: &PathBuf) -> WalStore {
        WalStore::open("200M", path.clone(), Arc::new(NotifyHub::new())).unwrap()
    }

    async fn room(store: &WalStore) -> Room {
        store
            .create_room(NewRoom {
                name: "Main".into(),
                office: "200M".into(),
                capacity: 8,
                amenities: vec!["TV".into()],
            })
            .await
            .unwrap()
    }

    fn draft(room_id: Ulid, user: &str, start: Ms, end: Ms) -> NewReservation {
        NewReservation {
            room_id,
            user: user.into(),
            office: "200M".into(),
            title: "Planning".into(),
            description: None,
            attendees: 2,
            span: Span::new(start, end),
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_pending_status() {
        let path = test_wal_path("create.wal");
        let store = open(&path);
        let room = room(&store).await;

        let r = store.create(draft(room.id, "alice", 1000, 2000)).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.created_at, r.updated_at);
        assert_eq!(store.find_by_id(r.id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn find_orders_by_start_and_applies_filter() {
        let path = test_wal_path("find.wal");
        let store = open(&path);
        let room = room(&store).await;

        let late = store.create(draft(room.id, "alice", 5000, 6000)).await.unwrap();
        let early = store.create(draft(room.id, "bob", 1000, 2000)).await.unwrap();

        let all = store.find(&ReservationFilter::all()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);

        let bobs = store.find(&ReservationFilter::all().for_user("bob")).await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id, early.id);

        let before_3000 = store
            .find(&ReservationFilter::for_room(room.id).start(TimeBound::Lt(3000)))
            .await
            .unwrap();
        assert_eq!(before_3000.len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_returns_none() {
        let path = test_wal_path("update_unknown.wal");
        let store = open(&path);
        let result = store
            .update(Ulid::new(), ReservationPatch::status(ReservationStatus::Approved))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let (room_id, reservation_id) = {
            let store = open(&path);
            let room = room(&store).await;
            let r = store.create(draft(room.id, "alice", 1000, 2000)).await.unwrap();
            store
                .update(r.id, ReservationPatch::status(ReservationStatus::Approved))
                .await
                .unwrap();
            store
                .emit(OutboundNotification {
                    user: "alice".into(),
                    message: "hello".into(),
                    kind: NotificationKind::Success,
                })
                .await
                .unwrap();
            (room.id, r.id)
        };

        let store = open(&path);
        assert!(store.find_room(room_id).await.unwrap().is_some());
        let r = store.find_by_id(reservation_id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Approved);
        assert_eq!(store.list_for("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compact.wal");
        let reservation_id = {
            let store = open(&path);
            let room = room(&store).await;
            let r = store.create(draft(room.id, "alice", 1000, 2000)).await.unwrap();
            for status in [
                ReservationStatus::Approved,
                ReservationStatus::Cancelled,
                ReservationStatus::Rejected,
            ] {
                store.update(r.id, ReservationPatch::status(status)).await.unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 5);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            r.id
        };

        let store = open(&path);
        let r = store.find_by_id(reservation_id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Rejected);
        assert_eq!(store.list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inbox_is_per_user_and_newest_first() {
        let path = test_wal_path("inbox.wal");
        let store = open(&path);
        for (user, message) in [("alice", "first"), ("bob", "other"), ("alice", "second")] {
            store
                .emit(OutboundNotification {
                    user: user.into(),
                    message: message.into(),
                    kind: NotificationKind::Info,
                })
                .await
                .unwrap();
        }

        let inbox = store.list_for("alice").await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].message, "second");

        // Someone else's notification is invisible to mark_read.
        assert!(store.mark_read("bob", inbox[0].id).await.unwrap().is_none());
        let read = store.mark_read("alice", inbox[0].id).await.unwrap().unwrap();
        assert!(read.is_read);
    }

    #[tokio::test]
    async fn emit_reaches_live_subscribers() {
        let path = test_wal_path("subscribe.wal");
        let store = open(&path);
        let mut rx = store.hub().subscribe("alice");
        store
            .emit(OutboundNotification {
                user: "alice".into(),
                message: "approved".into(),
                kind: NotificationKind::Success,
            })
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "approved");
    }
}
