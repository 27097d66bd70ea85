use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::store::{ReservationFilter, ReservationStore};

use super::{Engine, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::validation("reservation too long"));
    }
    Ok(())
}

impl Engine {
    /// True iff an active reservation of `room_id` other than `exclude`
    /// strictly overlaps `span`. Reads the store every time.
    pub async fn has_conflict(
        &self,
        room_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let filter = ReservationFilter::overlapping(room_id, span, exclude);
        let hits = self.collab.reservations.find(&filter).await?;
        if let Some(first) = hits.first() {
            debug!(room = %room_id, blocking = %first.id, status = %first.status, "conflict");
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        }
        Ok(!hits.is_empty())
    }
}
