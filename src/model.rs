use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Caller identity as presented at login.
pub type UserId = String;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Reservation lifecycle ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

/// How strictly status updates are checked against the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionPolicy {
    /// Any update target is accepted from any state, including terminal ones.
    #[default]
    Lenient,
    /// Only `pending` reservations may move; terminal states are final.
    Strict,
}

impl ReservationStatus {
    pub const ACTIVE: [ReservationStatus; 2] = [ReservationStatus::Pending, ReservationStatus::Approved];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Active reservations count toward conflict detection.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }

    /// Anything past `pending`; strict policy freezes these.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// Transition table. `pending` is never a target; leaving a terminal
    /// state depends on the policy.
    pub fn can_transition_to(&self, to: ReservationStatus, policy: TransitionPolicy) -> bool {
        if to == ReservationStatus::Pending {
            return false;
        }
        !self.is_terminal() || policy == TransitionPolicy::Lenient
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "approved" => Ok(ReservationStatus::Approved),
            "rejected" => Ok(ReservationStatus::Rejected),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(user: impl Into<UserId>, role: Role) -> Self {
        Self { user: user.into(), role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub office: String,
    pub capacity: u32,
    pub amenities: Vec<String>,
    pub is_active: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub name: String,
    pub office: String,
    pub capacity: u32,
    pub amenities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user: UserId,
    pub office: String,
    pub title: String,
    pub description: Option<String>,
    pub attendees: u32,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Fields the store needs to create a reservation. Id, status and
/// timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub room_id: Ulid,
    pub user: UserId,
    pub office: String,
    pub title: String,
    pub description: Option<String>,
    pub attendees: u32,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn status(status: ReservationStatus) -> Self {
        Self { status: Some(status) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user: UserId,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: Ms,
}

/// A notification on its way to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundNotification {
    pub user: UserId,
    pub message: String,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySlot {
    pub span: Span,
    pub available: bool,
}

// ── Per-room ledger ──────────────────────────────────────────────

/// All reservations of one room, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct RoomLedger {
    pub reservations: Vec<Reservation>,
}

impl RoomLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations starting strictly before `end_exclusive`.
    /// Uses binary search to skip everything at or after the bound.
    pub fn starting_before(&self, end_exclusive: Ms) -> &[Reservation] {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < end_exclusive);
        &self.reservations[..right_bound]
    }

    /// Return only reservations whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.starting_before(query.end)
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL events. Flat, no nesting beyond the records themselves.
/// This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: ReservationStatus,
        updated_at: Ms,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        id: Ulid,
    },
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn reservation(room_id: Ulid, start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id,
            user: "alice".into(),
            office: "200M".into(),
            title: "Standup".into(),
            description: None,
            attendees: 1,
            span: Span::new(start, end),
            status,
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::reservation;
    use super::*;

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration_ms(), 100);
    }

    #[test]
    fn ledger_keeps_start_order() {
        let room = Ulid::new();
        let mut ledger = RoomLedger::new();
        ledger.insert(reservation(room, 300, 400, ReservationStatus::Pending));
        ledger.insert(reservation(room, 100, 200, ReservationStatus::Approved));
        ledger.insert(reservation(room, 200, 300, ReservationStatus::Rejected));
        let starts: Vec<Ms> = ledger.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn ledger_overlapping_skips_past_and_future() {
        let room = Ulid::new();
        let mut ledger = RoomLedger::new();
        ledger.insert(reservation(room, 100, 200, ReservationStatus::Pending));
        ledger.insert(reservation(room, 450, 600, ReservationStatus::Pending));
        ledger.insert(reservation(room, 1000, 1100, ReservationStatus::Pending));

        let hits: Vec<_> = ledger.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn ledger_overlapping_adjacent_not_included() {
        let room = Ulid::new();
        let mut ledger = RoomLedger::new();
        ledger.insert(reservation(room, 100, 200, ReservationStatus::Pending));
        assert_eq!(ledger.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(ledger.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn ledger_get_mut_updates_in_place() {
        let room = Ulid::new();
        let mut ledger = RoomLedger::new();
        let r = reservation(room, 100, 200, ReservationStatus::Pending);
        let id = r.id;
        ledger.insert(r);
        ledger.get_mut(id).unwrap().status = ReservationStatus::Approved;
        assert_eq!(ledger.get(id).unwrap().status, ReservationStatus::Approved);
        assert!(ledger.get(Ulid::new()).is_none());
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!("approved".parse::<ReservationStatus>().unwrap(), ReservationStatus::Approved);
        assert_eq!(" Cancelled ".parse::<ReservationStatus>().unwrap(), ReservationStatus::Cancelled);
        assert!("done".parse::<ReservationStatus>().is_err());
        assert_eq!(ReservationStatus::Rejected.to_string(), "rejected");
    }

    #[test]
    fn only_pending_and_approved_are_active() {
        assert!(ReservationStatus::Pending.is_active());
        assert!(ReservationStatus::Approved.is_active());
        assert!(!ReservationStatus::Rejected.is_active());
        assert!(!ReservationStatus::Cancelled.is_active());
    }

    #[test]
    fn transition_table_never_targets_pending() {
        for policy in [TransitionPolicy::Lenient, TransitionPolicy::Strict] {
            for from in [
                ReservationStatus::Pending,
                ReservationStatus::Approved,
                ReservationStatus::Rejected,
                ReservationStatus::Cancelled,
            ] {
                assert!(!from.can_transition_to(ReservationStatus::Pending, policy));
            }
        }
    }

    #[test]
    fn strict_policy_freezes_terminal_states() {
        use ReservationStatus::*;
        let strict = TransitionPolicy::Strict;
        assert!(Pending.can_transition_to(Approved, strict));
        assert!(Pending.can_transition_to(Rejected, strict));
        assert!(Pending.can_transition_to(Cancelled, strict));
        assert!(!Rejected.can_transition_to(Approved, strict));
        assert!(!Approved.can_transition_to(Cancelled, strict));

        assert!(!Pending.is_terminal());
        for terminal in [Approved, Rejected, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Approved, Rejected, Cancelled] {
                assert!(!terminal.can_transition_to(to, strict), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn lenient_policy_allows_leaving_terminal_states() {
        use ReservationStatus::*;
        let lenient = TransitionPolicy::Lenient;
        assert!(Rejected.can_transition_to(Approved, lenient));
        assert!(Cancelled.can_transition_to(Rejected, lenient));
        assert!(Approved.can_transition_to(Approved, lenient));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: reservation(Ulid::new(), 0, 1000, ReservationStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
