use tracing::{info, warn};
use ulid::Ulid;

use crate::directory::AdminDirectory;
use crate::limits::*;
use crate::model::*;
use crate::store::{NotificationInbox, ReservationStore, RoomDirectory};

use super::conflict::validate_span;
use super::{Engine, EngineError};

const MISSING_FIELD: &str = "missing required field";
const INVALID_RANGE: &str = "invalid time range";
const SLOT_TAKEN: &str = "slot already booked or pending";

pub const DEFAULT_AMENITIES: [&str; 3] = ["TV", "Whiteboard", "Video Conferencing"];

/// A booking intent as received from a client. Every field is optional so
/// that missing input is reported as a validation error, not a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub room_id: Option<Ulid>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub attendees: Option<i64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomRequest {
    pub name: Option<String>,
    pub capacity: Option<i64>,
    pub amenities: Vec<String>,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl Engine {
    pub async fn create_reservation(
        &self,
        caller: &Identity,
        request: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        let (Some(room_id), Some(title), Some(start), Some(end)) = (
            request.room_id,
            non_blank(request.title.as_deref()),
            non_blank(request.start_time.as_deref()),
            non_blank(request.end_time.as_deref()),
        ) else {
            return Err(EngineError::validation(MISSING_FIELD));
        };
        let span = self.parse_span(start, end)?;

        let attendees = match request.attendees {
            None => 1,
            Some(n) if n >= 1 && n <= i64::from(MAX_ATTENDEES) => n as u32,
            Some(n) => {
                return Err(EngineError::Validation(format!(
                    "attendees must be between 1 and {MAX_ATTENDEES}, got {n}"
                )));
            }
        };
        if title.len() > MAX_TITLE_LEN {
            return Err(EngineError::validation("title too long"));
        }
        let description = non_blank(request.description.as_deref()).map(str::to_string);
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::validation("description too long"));
        }

        let room = self
            .collab
            .rooms
            .find_room(room_id)
            .await?
            .ok_or_else(|| EngineError::not_found("room", room_id))?;

        let reservation = {
            let _room_guard = self.lock_room(room_id).await;
            if self.has_conflict(room_id, span, None).await? {
                return Err(EngineError::Conflict(SLOT_TAKEN.into()));
            }
            self.collab
                .reservations
                .create(NewReservation {
                    room_id,
                    user: caller.user.clone(),
                    office: room.office,
                    title: title.to_string(),
                    description,
                    attendees,
                    span,
                })
                .await?
        };
        info!(id = %reservation.id, room = %room_id, user = %caller.user, "reservation requested");

        self.notify_admins(&reservation).await;
        Ok(reservation)
    }

    fn parse_span(&self, start: &str, end: &str) -> Result<Span, EngineError> {
        let invalid = || EngineError::validation(INVALID_RANGE);
        let start = self.clock.parse_instant(start).ok_or_else(invalid)?;
        let end = self.clock.parse_instant(end).ok_or_else(invalid)?;
        if start >= end {
            return Err(invalid());
        }
        let span = Span::new(start, end);
        validate_span(&span)?;
        Ok(span)
    }

    /// Fire-and-forget: nothing here can fail the request.
    async fn notify_admins(&self, reservation: &Reservation) {
        let admins = match self.collab.admins.list_admins().await {
            Ok(admins) => admins,
            Err(e) => {
                warn!(id = %reservation.id, "could not list admins to notify: {e}");
                return;
            }
        };
        let message = format!(
            "New reservation request: {} ({} - {})",
            reservation.title,
            self.clock.format(reservation.span.start),
            self.clock.format(reservation.span.end),
        );
        for admin in admins {
            self.outbox.enqueue(OutboundNotification {
                user: admin,
                message: message.clone(),
                kind: NotificationKind::Info,
            });
        }
    }

    pub async fn update_status(
        &self,
        caller: &Identity,
        id: Ulid,
        new_status: &str,
    ) -> Result<Reservation, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden(
                "only admins can change reservation status".into(),
            ));
        }
        let to: ReservationStatus = new_status.parse().map_err(EngineError::Validation)?;
        if to == ReservationStatus::Pending {
            return Err(EngineError::validation("invalid status: pending"));
        }

        let room_id = self
            .collab
            .reservations
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("reservation", id))?
            .room_id;

        let updated = {
            let _room_guard = self.lock_room(room_id).await;
            let current = self
                .collab
                .reservations
                .find_by_id(id)
                .await?
                .ok_or_else(|| EngineError::not_found("reservation", id))?;

            if !current.status.can_transition_to(to, self.policy) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            if to == ReservationStatus::Approved
                && self.has_conflict(room_id, current.span, Some(id)).await?
            {
                return Err(EngineError::Conflict(SLOT_TAKEN.into()));
            }

            self.collab
                .reservations
                .update(id, ReservationPatch::status(to))
                .await?
                .ok_or_else(|| EngineError::not_found("reservation", id))?
        };
        info!(id = %id, status = %to, by = %caller.user, "reservation status changed");

        let kind = if to == ReservationStatus::Approved {
            NotificationKind::Success
        } else {
            NotificationKind::Warning
        };
        self.outbox.enqueue(OutboundNotification {
            user: updated.user.clone(),
            message: format!("Your reservation \"{}\" is now {}.", updated.title, to),
            kind,
        });
        Ok(updated)
    }

    pub async fn create_room(&self, caller: &Identity, request: RoomRequest) -> Result<Room, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden("only admins can create rooms".into()));
        }
        let Some(name) = non_blank(request.name.as_deref()) else {
            return Err(EngineError::validation(MISSING_FIELD));
        };
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::validation("room name too long"));
        }
        let capacity = match request.capacity {
            None => DEFAULT_ROOM_CAPACITY,
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|c| *c >= 1)
                .ok_or_else(|| EngineError::Validation(format!("invalid capacity: {n}")))?,
        };

        let mut amenities: Vec<String> = Vec::new();
        for amenity in request.amenities.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            if amenity.len() > MAX_AMENITY_LEN {
                return Err(EngineError::validation("amenity name too long"));
            }
            if !amenities.iter().any(|a| a == amenity) {
                amenities.push(amenity.to_string());
            }
        }
        if amenities.len() > MAX_AMENITIES {
            return Err(EngineError::validation("too many amenities"));
        }
        if self.collab.rooms.list_rooms().await?.len() >= MAX_ROOMS_PER_OFFICE {
            return Err(EngineError::validation("too many rooms"));
        }

        let room = self
            .collab
            .rooms
            .create_room(NewRoom {
                name: name.to_string(),
                office: self.office().to_string(),
                capacity,
                amenities,
            })
            .await?;
        info!(id = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Seed the office's default room when it has none. Returns the new room.
    pub async fn ensure_default_room(&self) -> Result<Option<Room>, EngineError> {
        if !self.collab.rooms.list_rooms().await?.is_empty() {
            return Ok(None);
        }
        let room = self
            .collab
            .rooms
            .create_room(NewRoom {
                name: format!("{} Main Meeting Room", self.office()),
                office: self.office().to_string(),
                capacity: DEFAULT_ROOM_CAPACITY,
                amenities: DEFAULT_AMENITIES.iter().map(|a| a.to_string()).collect(),
            })
            .await?;
        info!(office = %self.office(), id = %room.id, "seeded default room");
        Ok(Some(room))
    }

    pub async fn mark_notification_read(
        &self,
        caller: &Identity,
        id: Ulid,
    ) -> Result<Notification, EngineError> {
        self.collab
            .inbox
            .mark_read(&caller.user, id)
            .await?
            .ok_or_else(|| EngineError::not_found("notification", id))
    }
}
