use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

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

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Intersection of two spans, `None` if they do not overlap.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        if !self.overlaps(window) {
            return None;
        }
        Some(Span::new(
            self.start.max(window.start),
            self.end.min(window.end),
        ))
    }
}

// ── Status state machine ─────────────────────────────────────────

/// Lifecycle of a booking request.
///
/// `Pending` is the only non-terminal state; every transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approval,
    Denied,
    Completed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Approval,
        RequestStatus::Denied,
        RequestStatus::Completed,
    ];

    /// Statuses that occupy slots on the calendar.
    pub const BLOCKING: [RequestStatus; 3] = [
        RequestStatus::Pending,
        RequestStatus::Approval,
        RequestStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approval => "approval",
            RequestStatus::Denied => "denied",
            RequestStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Approval)
                | (RequestStatus::Pending, RequestStatus::Denied)
                | (RequestStatus::Pending, RequestStatus::Completed)
        )
    }

    /// Denied requests never block a slot.
    pub fn blocks_slots(&self) -> bool {
        !matches!(self, RequestStatus::Denied)
    }

    /// Committed by the approval workflow; no other request may overlap it.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, RequestStatus::Approval | RequestStatus::Completed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approval" | "approved" => Ok(RequestStatus::Approval),
            "denied" => Ok(RequestStatus::Denied),
            "completed" => Ok(RequestStatus::Completed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// A submitted booking request. The store owns the canonical copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub status: RequestStatus,
    pub resource_id: Ulid,
    pub owner_id: Ulid,
    /// The organizational group the booking is made on behalf of.
    pub group_id: Ulid,
    pub approver_id: Option<Ulid>,
    pub secondary_approver_id: Option<Ulid>,
    pub span: Span,
    pub title: String,
    pub description: Option<String>,
    pub reason: Option<String>,
}

/// Unvalidated submission. Required fields are optional here so a missing
/// one can be reported by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDraft {
    pub resource_id: Option<Ulid>,
    pub owner_id: Option<Ulid>,
    pub group_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub reason: Option<String>,
}

/// A status transition requested by the approval workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: RequestStatus,
    pub actor: Ulid,
    pub secondary_approver_id: Option<Ulid>,
}

impl StatusChange {
    pub fn new(status: RequestStatus, actor: Ulid) -> Self {
        Self {
            status,
            actor,
            secondary_approver_id: None,
        }
    }

    pub fn with_secondary_approver(mut self, approver: Ulid) -> Self {
        self.secondary_approver_id = Some(approver);
        self
    }
}

/// Which requests `list_requests` returns. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub resource_id: Option<Ulid>,
    pub owner_id: Option<Ulid>,
    pub group_id: Option<Ulid>,
    pub statuses: Option<Vec<RequestStatus>>,
}

impl RequestFilter {
    pub fn matches(&self, req: &BookingRequest) -> bool {
        self.resource_id.is_none_or(|r| r == req.resource_id)
            && self.owner_id.is_none_or(|o| o == req.owner_id)
            && self.group_id.is_none_or(|g| g == req.group_id)
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&req.status))
    }
}

/// All requests targeting one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub requests: Vec<BookingRequest>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            requests: Vec::new(),
        }
    }

    /// Insert request maintaining sort order by span.start.
    pub fn insert_request(&mut self, request: BookingRequest) {
        let pos = self
            .requests
            .partition_point(|r| r.span.start <= request.span.start);
        self.requests.insert(pos, request);
    }

    pub fn get(&self, id: &Ulid) -> Option<&BookingRequest> {
        self.requests.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut BookingRequest> {
        self.requests.iter_mut().find(|r| r.id == *id)
    }

    /// Return only requests whose span overlaps the query window.
    /// Uses binary search to skip requests starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingRequest> {
        let right_bound = self
            .requests
            .partition_point(|r| r.span.start < query.end);
        self.requests[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// First confirmed request overlapping `span`, other than `except`.
    pub fn confirmed_overlap(&self, span: &Span, except: Option<Ulid>) -> Option<&BookingRequest> {
        self.overlapping(span)
            .find(|r| r.status.is_confirmed() && Some(r.id) != except)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: Option<String>,
    },
    AccountRegistered {
        id: Ulid,
    },
    GroupRegistered {
        id: Ulid,
    },
    RequestCreated {
        request: BookingRequest,
    },
    StatusChanged {
        id: Ulid,
        resource_id: Ulid,
        from: RequestStatus,
        to: RequestStatus,
        actor: Ulid,
        secondary_approver_id: Option<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub request_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: Ms, end: Ms, status: RequestStatus) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            status,
            resource_id: Ulid::new(),
            owner_id: Ulid::new(),
            group_id: Ulid::new(),
            approver_id: None,
            secondary_approver_id: None,
            span: Span::new(start, end),
            title: "standup".into(),
            description: None,
            reason: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_clamp() {
        let window = Span::new(100, 200);
        assert_eq!(Span::new(50, 150).clamp_to(&window), Some(Span::new(100, 150)));
        assert_eq!(Span::new(0, 500).clamp_to(&window), Some(window));
        assert_eq!(Span::new(200, 300).clamp_to(&window), None);
    }

    #[test]
    fn only_pending_transitions() {
        for next in RequestStatus::ALL {
            let allowed = RequestStatus::Pending.can_transition_to(next);
            assert_eq!(allowed, next != RequestStatus::Pending);
        }
        for from in [
            RequestStatus::Approval,
            RequestStatus::Denied,
            RequestStatus::Completed,
        ] {
            assert!(from.is_terminal());
            for next in RequestStatus::ALL {
                assert!(!from.can_transition_to(next), "{from} -> {next}");
            }
        }
        assert!(!RequestStatus::Pending.is_terminal());
    }

    #[test]
    fn denied_never_blocks() {
        assert!(!RequestStatus::Denied.blocks_slots());
        assert!(!RequestStatus::BLOCKING.contains(&RequestStatus::Denied));
        assert!(RequestStatus::BLOCKING.iter().all(|s| s.blocks_slots()));
    }

    #[test]
    fn status_text_form() {
        for s in RequestStatus::ALL {
            assert_eq!(s.as_str().parse::<RequestStatus>().unwrap(), s);
        }
        assert_eq!("APPROVED".parse::<RequestStatus>().unwrap(), RequestStatus::Approval);
        assert!("cancelled".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn requests_kept_sorted() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_request(request(300, 400, RequestStatus::Pending));
        rs.insert_request(request(100, 200, RequestStatus::Pending));
        rs.insert_request(request(200, 300, RequestStatus::Approval));
        let starts: Vec<Ms> = rs.requests.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_request(request(100, 200, RequestStatus::Pending));
        rs.insert_request(request(450, 600, RequestStatus::Pending));
        rs.insert_request(request(1000, 1100, RequestStatus::Pending));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_request(request(100, 200, RequestStatus::Approval));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_long_request_spanning_query() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        rs.insert_request(request(0, 10_000, RequestStatus::Pending));
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn confirmed_overlap_ignores_pending_and_self() {
        let mut rs = ResourceState::new(Ulid::new(), None);
        let pending = request(100, 200, RequestStatus::Pending);
        let approved = request(150, 250, RequestStatus::Approval);
        let approved_id = approved.id;
        rs.insert_request(pending);
        rs.insert_request(approved);

        let hit = rs.confirmed_overlap(&Span::new(100, 160), None).unwrap();
        assert_eq!(hit.id, approved_id);
        assert!(rs.confirmed_overlap(&Span::new(100, 160), Some(approved_id)).is_none());
        assert!(rs.confirmed_overlap(&Span::new(100, 150), None).is_none());
    }

    #[test]
    fn filter_matches() {
        let req = request(0, 10, RequestStatus::Pending);
        assert!(RequestFilter::default().matches(&req));
        let by_owner = RequestFilter {
            owner_id: Some(req.owner_id),
            ..Default::default()
        };
        assert!(by_owner.matches(&req));
        let other_group = RequestFilter {
            group_id: Some(Ulid::new()),
            ..Default::default()
        };
        assert!(!other_group.matches(&req));
        let denied_only = RequestFilter {
            statuses: Some(vec![RequestStatus::Denied]),
            ..Default::default()
        };
        assert!(!denied_only.matches(&req));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RequestCreated {
            request: request(1000, 2000, RequestStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
