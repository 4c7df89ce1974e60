use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_request(&self, id: Ulid) -> Result<BookingRequest, EngineError> {
        let resource_id = self
            .get_resource_for_request(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Requests on `resource_id` with a status in `statuses` whose span
    /// intersects `[window_start, window_end)`, ordered by start time.
    pub async fn find_overlapping(
        &self,
        resource_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BookingRequest>, EngineError> {
        if window_start >= window_end {
            return Err(EngineError::Validation {
                field: "window",
                reason: "start must be before end",
            });
        }
        if window_end - window_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;

        let window = Span::new(window_start, window_end);
        Ok(guard
            .overlapping(&window)
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    /// All requests matching `filter`, ordered by start time.
    pub async fn list_requests(&self, filter: &RequestFilter) -> Vec<BookingRequest> {
        let resources = match filter.resource_id {
            Some(rid) => self.get_resource(&rid).into_iter().collect(),
            None => self
                .state
                .iter()
                .map(|e| e.value().clone())
                .collect::<Vec<_>>(),
        };

        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(guard.requests.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                request_count: guard.requests.len(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
