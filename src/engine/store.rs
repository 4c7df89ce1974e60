use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Read side of the request store, as seen by availability computation.
///
/// Availability only needs the overlap query, so it depends on this trait
/// rather than on [`Engine`]; tests substitute slow or failing stores.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_overlapping(
        &self,
        resource_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BookingRequest>, EngineError>;
}

#[async_trait]
impl RequestStore for Engine {
    async fn find_overlapping(
        &self,
        resource_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BookingRequest>, EngineError> {
        Engine::find_overlapping(self, resource_id, window_start, window_end, statuses).await
    }
}
