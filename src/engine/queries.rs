use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::store::{NotificationInbox, ReservationFilter, ReservationStore, RoomDirectory, TimeBound};

use super::availability::{business_slots, slot_grid, OPENING_HOUR};
use super::{Engine, EngineError};

impl Engine {
    /// Admins see every reservation, everyone else only their own.
    /// Ordered by start time.
    pub async fn list_reservations(
        &self,
        caller: &Identity,
        room: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut filter = match room {
            Some(room) => ReservationFilter::for_room(room),
            None => ReservationFilter::all(),
        };
        if !caller.is_admin() {
            filter = filter.for_user(caller.user.clone());
        }
        Ok(self.collab.reservations.find(&filter).await?)
    }

    /// The 18 half-hour slots of `date` (office time) with their availability.
    /// An unknown room yields an all-free grid.
    pub async fn compute_availability(
        &self,
        room_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let invalid = || EngineError::validation("invalid date");
        let (day_start, day_end) = self.clock.day_bounds(date).ok_or_else(invalid)?;
        let opening = self.clock.at(date, OPENING_HOUR, 0).ok_or_else(invalid)?;

        let filter = ReservationFilter::for_room(room_id)
            .active()
            .start(TimeBound::Le(day_end))
            .end(TimeBound::Ge(day_start));
        let occupied: Vec<Span> = self
            .collab
            .reservations
            .find(&filter)
            .await?
            .into_iter()
            .map(|r| r.span)
            .collect();

        Ok(slot_grid(&business_slots(opening), &occupied))
    }

    /// Parse a `YYYY-MM-DD` calendar date.
    pub fn parse_date(&self, raw: &str) -> Result<NaiveDate, EngineError> {
        self.clock
            .parse_date(raw)
            .ok_or_else(|| EngineError::Validation(format!("invalid date: {raw}")))
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, EngineError> {
        Ok(self.collab.rooms.list_rooms().await?)
    }

    pub async fn get_reservation(&self, caller: &Identity, id: Ulid) -> Result<Reservation, EngineError> {
        self.collab
            .reservations
            .find_by_id(id)
            .await?
            .filter(|r| caller.is_admin() || r.user == caller.user)
            .ok_or_else(|| EngineError::not_found("reservation", id))
    }

    /// The caller's notifications, newest first.
    pub async fn list_notifications(&self, caller: &Identity) -> Result<Vec<Notification>, EngineError> {
        Ok(self.collab.inbox.list_for(&caller.user).await?)
    }
}
