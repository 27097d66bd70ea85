//! Collaborator interfaces the reservation engine talks to, plus the
//! WAL-backed store that implements them.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One comparison against a timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    Lt(Ms),
    Le(Ms),
    Gt(Ms),
    Ge(Ms),
}

impl TimeBound {
    pub fn admits(&self, t: Ms) -> bool {
        match *self {
            TimeBound::Lt(b) => t < b,
            TimeBound::Le(b) => t <= b,
            TimeBound::Gt(b) => t > b,
            TimeBound::Ge(b) => t >= b,
        }
    }

    /// Smallest start value that fails this bound, if it is an upper bound.
    /// Lets sorted ledgers stop scanning early.
    fn exclusive_upper(&self) -> Option<Ms> {
        match *self {
            TimeBound::Lt(b) => Some(b),
            TimeBound::Le(b) => Some(b.saturating_add(1)),
            TimeBound::Gt(_) | TimeBound::Ge(_) => None,
        }
    }
}

/// Predicate over reservations. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room: Option<Ulid>,
    pub user: Option<UserId>,
    pub statuses: Vec<ReservationStatus>,
    pub exclude: Option<Ulid>,
    pub start: Vec<TimeBound>,
    pub end: Vec<TimeBound>,
}

impl ReservationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_room(room: Ulid) -> Self {
        Self { room: Some(room), ..Self::default() }
    }

    pub fn for_user(mut self, user: impl Into<UserId>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_statuses(mut self, statuses: &[ReservationStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Restrict to `pending` and `approved`.
    pub fn active(self) -> Self {
        self.with_statuses(&ReservationStatus::ACTIVE)
    }

    pub fn excluding(mut self, id: Option<Ulid>) -> Self {
        self.exclude = id;
        self
    }

    pub fn start(mut self, bound: TimeBound) -> Self {
        self.start.push(bound);
        self
    }

    pub fn end(mut self, bound: TimeBound) -> Self {
        self.end.push(bound);
        self
    }

    /// Active reservations of `room` whose `[start, end)` strictly overlaps `span`.
    pub fn overlapping(room: Ulid, span: Span, exclude: Option<Ulid>) -> Self {
        Self::for_room(room)
            .active()
            .start(TimeBound::Lt(span.end))
            .end(TimeBound::Gt(span.start))
            .excluding(exclude)
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.room.is_none_or(|room| r.room_id == room)
            && self.user.as_deref().is_none_or(|user| r.user == user)
            && (self.statuses.is_empty() || self.statuses.contains(&r.status))
            && self.exclude.is_none_or(|id| r.id != id)
            && self.start.iter().all(|b| b.admits(r.span.start))
            && self.end.iter().all(|b| b.admits(r.span.end))
    }

    /// Tightest exclusive upper bound on `start`, if any.
    pub fn start_upper_bound(&self) -> Option<Ms> {
        self.start.iter().filter_map(TimeBound::exclusive_upper).min()
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_room(&self, id: Ulid) -> Result<Option<Room>, StoreError>;
    /// Active rooms, oldest first.
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;
    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Matching reservations ordered by start time.
    async fn find(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError>;
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
    async fn create(&self, reservation: NewReservation) -> Result<Reservation, StoreError>;
    /// `Ok(None)` when no reservation has this id.
    async fn update(&self, id: Ulid, patch: ReservationPatch) -> Result<Option<Reservation>, StoreError>;
}

/// Best-effort delivery of notifications to users.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, notification: OutboundNotification) -> Result<(), StoreError>;
}

#[async_trait]
pub trait NotificationInbox: Send + Sync {
    /// The user's notifications, newest first.
    async fn list_for(&self, user: &str) -> Result<Vec<Notification>, StoreError>;
    /// `Ok(None)` when the notification is missing or belongs to someone else.
    async fn mark_read(&self, user: &str, id: Ulid) -> Result<Option<Notification>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::reservation;

    #[test]
    fn overlapping_filter_uses_strict_bounds() {
        let room = Ulid::new();
        let f = ReservationFilter::overlapping(room, Span::new(1000, 2000), None);
        assert!(f.matches(&reservation(room, 1500, 2500, ReservationStatus::Pending)));
        assert!(f.matches(&reservation(room, 500, 1001, ReservationStatus::Approved)));
        assert!(!f.matches(&reservation(room, 2000, 3000, ReservationStatus::Pending)));
        assert!(!f.matches(&reservation(room, 0, 1000, ReservationStatus::Pending)));
    }

    #[test]
    fn overlapping_filter_ignores_inactive_and_other_rooms() {
        let room = Ulid::new();
        let f = ReservationFilter::overlapping(room, Span::new(1000, 2000), None);
        assert!(!f.matches(&reservation(room, 1000, 2000, ReservationStatus::Rejected)));
        assert!(!f.matches(&reservation(room, 1000, 2000, ReservationStatus::Cancelled)));
        assert!(!f.matches(&reservation(Ulid::new(), 1000, 2000, ReservationStatus::Pending)));
    }

    #[test]
    fn excluded_id_never_matches() {
        let room = Ulid::new();
        let r = reservation(room, 1000, 2000, ReservationStatus::Pending);
        let f = ReservationFilter::overlapping(room, r.span, Some(r.id));
        assert!(!f.matches(&r));
    }

    #[test]
    fn inclusive_bounds() {
        let room = Ulid::new();
        let f = ReservationFilter::for_room(room)
            .start(TimeBound::Le(1000))
            .end(TimeBound::Ge(500));
        assert!(f.matches(&reservation(room, 1000, 1200, ReservationStatus::Pending)));
        assert!(f.matches(&reservation(room, 100, 500, ReservationStatus::Pending)));
        assert!(!f.matches(&reservation(room, 1001, 1200, ReservationStatus::Pending)));
        assert_eq!(f.start_upper_bound(), Some(1001));
    }

    #[test]
    fn user_filter() {
        let room = Ulid::new();
        let f = ReservationFilter::all().for_user("bob");
        assert!(!f.matches(&reservation(room, 0, 10, ReservationStatus::Pending)));
        let mut mine = reservation(room, 0, 10, ReservationStatus::Pending);
        mine.user = "bob".into();
        assert!(f.matches(&mine));
    }
}
