use ulid::Ulid;

use crate::model::*;

// ── Availability Registry ─────────────────────────────────────────

/// Existing window of the trainer that collides with `span`, if any.
pub fn overlapping_window(trainer: &ResourceState, span: &Span) -> Option<Ulid> {
    trainer
        .windows
        .iter()
        .find(|w| w.span.overlaps(span))
        .map(|w| w.id)
}

/// True iff at least one declared window fully covers `span`.
pub fn is_covered(trainer: &ResourceState, span: &Span) -> bool {
    trainer.windows.iter().any(|w| w.span.covers(span))
}

/// Bookable time of a trainer inside `query`: declared windows minus
/// active reservations.
pub fn free_spans(trainer: &ResourceState, query: &Span) -> Vec<Span> {
    let mut open: Vec<Span> = trainer
        .windows
        .iter()
        .filter(|w| w.span.overlaps(query))
        .map(|w| {
            Span::new(
                w.span.start.max(query.start),
                w.span.end.min(query.end),
            )
        })
        .collect();
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    let busy: Vec<Span> = trainer.overlapping(query).map(|r| r.span).collect();
    if busy.is_empty() {
        return open;
    }
    subtract_intervals(&open, &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` (sorted by start) from `base` (sorted, disjoint).
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trainer_with_windows(spans: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Trainer, None);
        for &(start, end) in spans {
            rs.windows.push(AvailabilityWindow {
                id: Ulid::new(),
                trainer_id: rs.id,
                span: Span::new(start, end),
            });
        }
        rs
    }

    fn book(rs: &mut ResourceState, start: Ms, end: Ms) {
        rs.insert_reservation(Reservation {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: ReservationKind::GroupActivity,
        });
    }

    #[test]
    fn covered_requires_full_containment() {
        let rs = trainer_with_windows(&[(900, 1200)]);
        assert!(is_covered(&rs, &Span::new(900, 1000)));
        assert!(is_covered(&rs, &Span::new(900, 1200)));
        assert!(!is_covered(&rs, &Span::new(850, 1000)));
        assert!(!is_covered(&rs, &Span::new(1100, 1300)));
    }

    #[test]
    fn covered_does_not_stitch_adjacent_windows() {
        // Two touching windows are still two windows; neither covers the whole span.
        let rs = trainer_with_windows(&[(900, 1000), (1000, 1100)]);
        assert!(!is_covered(&rs, &Span::new(950, 1050)));
    }

    #[test]
    fn overlapping_window_half_open() {
        let rs = trainer_with_windows(&[(900, 1000)]);
        assert!(overlapping_window(&rs, &Span::new(1000, 1100)).is_none());
        assert!(overlapping_window(&rs, &Span::new(800, 900)).is_none());
        assert_eq!(
            overlapping_window(&rs, &Span::new(950, 1100)),
            Some(rs.windows[0].id)
        );
    }

    #[test]
    fn free_spans_subtracts_reservations() {
        let mut rs = trainer_with_windows(&[(900, 1200), (1300, 1500)]);
        book(&mut rs, 1000, 1100);
        book(&mut rs, 1300, 1350);
        let free = free_spans(&rs, &Span::new(0, 2000));
        assert_eq!(
            free,
            vec![
                Span::new(900, 1000),
                Span::new(1100, 1200),
                Span::new(1350, 1500),
            ]
        );
    }

    #[test]
    fn free_spans_clamped_to_query() {
        let rs = trainer_with_windows(&[(900, 1200)]);
        assert_eq!(
            free_spans(&rs, &Span::new(1000, 1100)),
            vec![Span::new(1000, 1100)]
        );
        assert!(free_spans(&rs, &Span::new(1200, 1300)).is_empty());
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[
            Span::new(0, 10),
            Span::new(10, 20),
            Span::new(15, 30),
            Span::new(40, 50),
        ]);
        assert_eq!(merged, vec![Span::new(0, 30), Span::new(40, 50)]);
    }

    #[test]
    fn subtract_splits_base() {
        let out = subtract_intervals(&[Span::new(0, 100)], &[Span::new(20, 30), Span::new(50, 60)]);
        assert_eq!(
            out,
            vec![Span::new(0, 20), Span::new(30, 50), Span::new(60, 100)]
        );
    }
}
