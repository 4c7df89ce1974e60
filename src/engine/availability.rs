use crate::model::*;

// ── Slot discretization ───────────────────────────────────────────

/// Reduce occupied spans to the start instants of every slot they touch.
///
/// The window is cut into `slot_ms`-wide slots aligned to `window.start`. A
/// slot is blocked when its span intersects any of `spans`. The result is
/// ascending and distinct; spans outside the window contribute nothing.
pub fn blocked_slots(spans: &[Span], window: &Span, slot_ms: Ms) -> Vec<Ms> {
    debug_assert!(slot_ms > 0, "slot width must be positive");

    let mut clamped: Vec<Span> = spans.iter().filter_map(|s| s.clamp_to(window)).collect();
    clamped.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&clamped);

    let mut slots: Vec<Ms> = Vec::new();
    for span in merged {
        let first = (span.start - window.start) / slot_ms;
        // ceil: a span ending mid-slot still occupies that slot
        let last = (span.end - window.start + slot_ms - 1) / slot_ms;
        for k in first..last {
            let t = window.start + k * slot_ms;
            // Disjoint spans can still share a slot when they don't sit on the grid
            if slots.last().is_some_and(|&prev| prev >= t) {
                continue;
            }
            slots.push(t);
        }
    }
    slots
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
