use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::calendar::{SlotCalendar, WeekReference};
use crate::engine::{blocked_slots, EngineError, RequestStore};
use crate::model::*;
use crate::observability;

/// Blocked slots of one resource for one work week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedWeek {
    pub resource_id: Ulid,
    pub window: Span,
    /// Ascending, distinct slot-start instants inside `window`.
    pub slots: Vec<Ms>,
}

/// Turns a requested week into the slots a scheduling UI must not offer.
///
/// Holds no cross-window state: each call re-runs the overlap query, so a
/// request spanning several weeks shows up in every window it touches.
pub struct AvailabilityService {
    store: Arc<dyn RequestStore>,
    calendar: SlotCalendar,
    query_timeout: Duration,
}

impl AvailabilityService {
    pub fn new(store: Arc<dyn RequestStore>, calendar: SlotCalendar, query_timeout: Duration) -> Self {
        Self {
            store,
            calendar,
            query_timeout,
        }
    }

    pub fn calendar(&self) -> &SlotCalendar {
        &self.calendar
    }

    /// Slots of the week containing `reference` that overlap a pending,
    /// approved or completed request on `resource_id`.
    ///
    /// A store failure or timeout is returned as [`EngineError::Unavailable`];
    /// callers must then refuse submission rather than treat the week as free.
    pub async fn blocked_slots(
        &self,
        resource_id: Ulid,
        reference: WeekReference,
    ) -> Result<BlockedWeek, EngineError> {
        let window = self
            .calendar
            .week_window(reference)
            .map_err(|_| EngineError::Validation {
                field: "reference",
                reason: "not a representable date",
            })?;

        let requests = self.fetch_blocking(resource_id, window).await?;
        let spans: Vec<Span> = requests
            .iter()
            .filter(|r| r.status.blocks_slots())
            .map(|r| r.span)
            .collect();

        Ok(BlockedWeek {
            resource_id,
            window,
            slots: blocked_slots(&spans, &window, self.calendar.slot_ms()),
        })
    }

    async fn fetch_blocking(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<BookingRequest>, EngineError> {
        let query = self.store.find_overlapping(
            resource_id,
            window.start,
            window.end,
            &RequestStatus::BLOCKING,
        );
        let result = match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Unavailable(format!(
                "overlap query exceeded {}ms",
                self.query_timeout.as_millis()
            ))),
        };
        if let Err(ref e @ EngineError::Unavailable(_)) = result {
            observability::report_unavailable("blocked_slots", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;

    /// Store double holding a fixed request list and applying the real
    /// intersection test.
    struct FixedStore {
        requests: Vec<BookingRequest>,
        calls: AtomicUsize,
    }

    impl FixedStore {
        fn new(requests: Vec<BookingRequest>) -> Self {
            Self {
                requests,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RequestStore for FixedStore {
        async fn find_overlapping(
            &self,
            resource_id: Ulid,
            window_start: Ms,
            window_end: Ms,
            statuses: &[RequestStatus],
        ) -> Result<Vec<BookingRequest>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let window = Span::new(window_start, window_end);
            Ok(self
                .requests
                .iter()
                .filter(|r| {
                    r.resource_id == resource_id
                        && statuses.contains(&r.status)
                        && r.span.overlaps(&window)
                })
                .cloned()
                .collect())
        }
    }

    /// Ignores the status filter, like a careless backend would.
    struct UnfilteredStore(Vec<BookingRequest>);

    #[async_trait]
    impl RequestStore for UnfilteredStore {
        async fn find_overlapping(
            &self,
            _resource_id: Ulid,
            _window_start: Ms,
            _window_end: Ms,
            _statuses: &[RequestStatus],
        ) -> Result<Vec<BookingRequest>, EngineError> {
            Ok(self.0.clone())
        }
    }

    struct DownStore;

    #[async_trait]
    impl RequestStore for DownStore {
        async fn find_overlapping(
            &self,
            _resource_id: Ulid,
            _window_start: Ms,
            _window_end: Ms,
            _statuses: &[RequestStatus],
        ) -> Result<Vec<BookingRequest>, EngineError> {
            Err(EngineError::Unavailable("connection refused".into()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl RequestStore for HangingStore {
        async fn find_overlapping(
            &self,
            _resource_id: Ulid,
            _window_start: Ms,
            _window_end: Ms,
            _statuses: &[RequestStatus],
        ) -> Result<Vec<BookingRequest>, EngineError> {
            futures::future::pending().await
        }
    }

    fn at(s: &str) -> Ms {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    fn request(resource_id: Ulid, start: &str, end: &str, status: RequestStatus) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            status,
            resource_id,
            owner_id: Ulid::new(),
            group_id: Ulid::new(),
            approver_id: None,
            secondary_approver_id: None,
            span: Span::new(at(start), at(end)),
            title: "planning".into(),
            description: None,
            reason: None,
        }
    }

    fn service(store: impl RequestStore + 'static) -> AvailabilityService {
        AvailabilityService::new(
            Arc::new(store),
            SlotCalendar::from_minutes(0, 30).unwrap(),
            Duration::from_millis(200),
        )
    }

    fn week_of(s: &str) -> WeekReference {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn approved_hour_blocks_two_slots() {
        let r1 = Ulid::new();
        let svc = service(FixedStore::new(vec![request(
            r1,
            "2026-10-12T10:00:00Z",
            "2026-10-12T11:00:00Z",
            RequestStatus::Approval,
        )]));

        let week = svc.blocked_slots(r1, week_of("2026-10-14")).await.unwrap();
        assert_eq!(
            week.slots,
            vec![at("2026-10-12T10:00:00Z"), at("2026-10-12T10:30:00Z")]
        );
        assert_eq!(week.window.start, at("2026-10-12T00:00:00Z"));
        assert_eq!(week.window.end, at("2026-10-17T00:00:00Z"));
    }

    #[tokio::test]
    async fn denied_requests_never_block() {
        let r1 = Ulid::new();
        let reqs = vec![
            request(r1, "2026-10-13T09:00:00Z", "2026-10-13T10:00:00Z", RequestStatus::Denied),
            request(r1, "2026-10-13T14:00:00Z", "2026-10-13T14:30:00Z", RequestStatus::Pending),
        ];
        let week = service(FixedStore::new(reqs.clone()))
            .blocked_slots(r1, week_of("2026-10-13"))
            .await
            .unwrap();
        assert_eq!(week.slots, vec![at("2026-10-13T14:00:00Z")]);

        // Even when the store hands back denied rows
        let week = service(UnfilteredStore(reqs))
            .blocked_slots(r1, week_of("2026-10-13"))
            .await
            .unwrap();
        assert_eq!(week.slots, vec![at("2026-10-13T14:00:00Z")]);
    }

    #[tokio::test]
    async fn pending_and_completed_block() {
        let r1 = Ulid::new();
        let svc = service(FixedStore::new(vec![
            request(r1, "2026-10-15T08:00:00Z", "2026-10-15T08:30:00Z", RequestStatus::Pending),
            request(r1, "2026-10-15T08:00:00Z", "2026-10-15T08:30:00Z", RequestStatus::Pending),
            request(r1, "2026-10-16T16:00:00Z", "2026-10-16T16:30:00Z", RequestStatus::Completed),
        ]));
        let week = svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        assert_eq!(
            week.slots,
            vec![at("2026-10-15T08:00:00Z"), at("2026-10-16T16:00:00Z")]
        );
    }

    #[tokio::test]
    async fn multi_week_request_blocks_each_window() {
        let r1 = Ulid::new();
        let store = FixedStore::new(vec![request(
            r1,
            "2026-10-16T23:00:00Z",
            "2026-10-19T01:00:00Z",
            RequestStatus::Approval,
        )]);
        let svc = service(store);

        let first = svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        assert_eq!(
            first.slots,
            vec![at("2026-10-16T23:00:00Z"), at("2026-10-16T23:30:00Z")]
        );

        let second = svc.blocked_slots(r1, week_of("2026-10-19")).await.unwrap();
        assert_eq!(
            second.slots,
            vec![at("2026-10-19T00:00:00Z"), at("2026-10-19T00:30:00Z")]
        );
    }

    #[tokio::test]
    async fn weekend_only_request_blocks_nothing() {
        let r1 = Ulid::new();
        let svc = service(FixedStore::new(vec![request(
            r1,
            "2026-10-17T00:00:00Z",
            "2026-10-18T12:00:00Z",
            RequestStatus::Approval,
        )]));
        let week = svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        assert!(week.slots.is_empty());
    }

    #[tokio::test]
    async fn other_resources_ignored() {
        let r1 = Ulid::new();
        let svc = service(FixedStore::new(vec![request(
            Ulid::new(),
            "2026-10-12T10:00:00Z",
            "2026-10-12T11:00:00Z",
            RequestStatus::Approval,
        )]));
        let week = svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        assert!(week.slots.is_empty());
    }

    #[tokio::test]
    async fn no_cached_state_between_calls() {
        let r1 = Ulid::new();
        let store = Arc::new(FixedStore::new(vec![]));
        let svc = AvailabilityService::new(
            store.clone(),
            SlotCalendar::from_minutes(0, 30).unwrap(),
            Duration::from_millis(200),
        );
        svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        svc.blocked_slots(r1, week_of("2026-10-12")).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_failure_is_not_an_empty_week() {
        let result = service(DownStore)
            .blocked_slots(Ulid::new(), week_of("2026-10-12"))
            .await;
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
    }

    #[tokio::test]
    async fn store_timeout_is_unavailable() {
        let result = service(HangingStore)
            .blocked_slots(Ulid::new(), week_of("2026-10-12"))
            .await;
        match result {
            Err(EngineError::Unavailable(msg)) => assert!(msg.contains("200ms"), "{msg}"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }
}
