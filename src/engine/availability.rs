use crate::model::*;

// ── Availability Grid ─────────────────────────────────────────────

pub const SLOT_MINUTES: Ms = 30;
pub const SLOTS_PER_DAY: usize = 18;
pub const OPENING_HOUR: u32 = 9;

const SLOT_MS: Ms = SLOT_MINUTES * 60_000;

/// The business day's half-hour slots, 09:00 to 18:00 when `opening` is
/// 09:00 office time.
pub fn business_slots(opening: Ms) -> Vec<Span> {
    (0..SLOTS_PER_DAY as Ms)
        .map(|i| {
            let start = opening + i * SLOT_MS;
            Span::new(start, start + SLOT_MS)
        })
        .collect()
}

/// Mark each slot unavailable iff an occupied span strictly overlaps it.
/// `slots` must be sorted and disjoint; `occupied` may be in any order.
pub fn slot_grid(slots: &[Span], occupied: &[Span]) -> Vec<AvailabilitySlot> {
    let mut busy = occupied.to_vec();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let mut bi = 0;
    slots
        .iter()
        .map(|&slot| {
            while bi < busy.len() && busy[bi].end <= slot.start {
                bi += 1;
            }
            let available = busy.get(bi).is_none_or(|b| !b.overlaps(&slot));
            AvailabilitySlot { span: slot, available }
        })
        .collect()
}

/// Merge sorted overlapping intervals into disjoint intervals.
/// Touching intervals stay separate so a slot boundary is never bridged.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start < last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const NINE: Ms = 9 * 3_600_000;
    const HALF: Ms = 30 * 60_000;

    fn available(grid: &[AvailabilitySlot]) -> Vec<bool> {
        grid.iter().map(|s| s.available).collect()
    }

    #[test]
    fn eighteen_half_hour_slots() {
        let slots = business_slots(NINE);
        assert_eq!(slots.len(), 18);
        assert_eq!(slots[0], Span::new(NINE, NINE + HALF));
        assert_eq!(slots[17].end, 18 * 3_600_000);
        assert!(slots.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn empty_day_is_all_available() {
        let grid = slot_grid(&business_slots(NINE), &[]);
        assert!(grid.iter().all(|s| s.available));
    }

    #[test]
    fn ten_to_eleven_blocks_two_slots() {
        let ten = 10 * 3_600_000;
        let grid = slot_grid(&business_slots(NINE), &[Span::new(ten, ten + 2 * HALF)]);
        let blocked: Vec<usize> = grid
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.available)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(blocked, vec![2, 3]);
    }

    #[test]
    fn partial_overlap_blocks_slot() {
        let grid = slot_grid(&business_slots(NINE), &[Span::new(NINE + 10 * 60_000, NINE + 40 * 60_000)]);
        assert_eq!(&available(&grid)[..3], &[false, false, true]);
    }

    #[test]
    fn spans_outside_business_hours_block_nothing() {
        let grid = slot_grid(
            &business_slots(NINE),
            &[Span::new(0, NINE), Span::new(18 * 3_600_000, 20 * 3_600_000)],
        );
        assert!(grid.iter().all(|s| s.available));
    }

    #[test]
    fn all_day_span_blocks_everything() {
        let grid = slot_grid(&business_slots(NINE), &[Span::new(0, 24 * 3_600_000)]);
        assert!(grid.iter().all(|s| !s.available));
    }

    #[test]
    fn unsorted_overlapping_input() {
        let grid = slot_grid(
            &business_slots(NINE),
            &[
                Span::new(NINE + 4 * HALF, NINE + 5 * HALF),
                Span::new(NINE, NINE + HALF),
                Span::new(NINE + HALF / 2, NINE + HALF + 1),
            ],
        );
        assert_eq!(&available(&grid)[..6], &[false, false, true, true, false, true]);
    }

    #[test]
    fn merge_keeps_touching_spans_apart() {
        let merged = merge_overlapping(&[Span::new(0, 10), Span::new(5, 20), Span::new(20, 30)]);
        assert_eq!(merged, vec![Span::new(0, 20), Span::new(20, 30)]);
    }
}
