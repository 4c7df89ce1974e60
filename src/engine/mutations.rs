use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_confirmed_conflict, validate_draft};
use super::{Engine, EngineError, SharedResourceState, WalCommand};

impl Engine {
    /// Mirror a bookable resource from the external resource service.
    ///
    /// The id is claimed atomically and the new calendar stays write-locked
    /// until its registration is durable, so concurrent registrations of one
    /// id cannot both succeed and no request can be logged against it first.
    pub async fn register_resource(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let rs: SharedResourceState = Arc::new(RwLock::new(ResourceState::new(id, name.clone())));
        let _held = rs
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::Unavailable("fresh resource lock contended".into()))?;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(rs.clone());
            }
        }
        // Claims racing past the length check above give theirs back.
        if self.state.len() > MAX_RESOURCES {
            self.state.remove_if(&id, |_, v| Arc::ptr_eq(v, &rs));
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let event = Event::ResourceRegistered { id, name };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove_if(&id, |_, v| Arc::ptr_eq(v, &rs));
            return Err(e);
        }
        info!("registered resource {id}");
        Ok(())
    }

    /// Mirror an identity from the external account service.
    pub async fn register_account(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.accounts.len() >= MAX_ACCOUNTS {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        if !self.accounts.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.accounts.len() > MAX_ACCOUNTS {
            self.accounts.remove(&id);
            return Err(EngineError::LimitExceeded("too many accounts"));
        }

        let event = Event::AccountRegistered { id };
        if let Err(e) = self.wal_append(&event).await {
            self.accounts.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Mirror a group from the external group directory.
    pub async fn register_group(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.groups.len() >= MAX_GROUPS {
            return Err(EngineError::LimitExceeded("too many groups"));
        }
        if !self.groups.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.groups.len() > MAX_GROUPS {
            self.groups.remove(&id);
            return Err(EngineError::LimitExceeded("too many groups"));
        }

        if let Err(e) = self.wal_append(&Event::GroupRegistered { id }).await {
            self.groups.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Validate a draft and persist it as a new pending request.
    ///
    /// Overlap with other pending requests is allowed: approval adjudicates
    /// them later. Overlap with a confirmed request is rejected here, which is
    /// the authoritative server-side check behind the advisory blocked-slot
    /// view.
    pub async fn create_request(&self, draft: RequestDraft) -> Result<BookingRequest, EngineError> {
        let valid = validate_draft(draft)?;
        let _gate = self.compaction_gate.read().await;
        let rs = self
            .get_resource(&valid.resource_id)
            .ok_or(EngineError::NotFound(valid.resource_id))?;
        if !self.account_exists(&valid.owner_id) {
            return Err(EngineError::NotFound(valid.owner_id));
        }
        if !self.group_exists(&valid.group_id) {
            return Err(EngineError::NotFound(valid.group_id));
        }

        let mut guard = rs.write().await;
        // A registration whose log write failed is withdrawn while still locked.
        if !self.is_registered(&valid.resource_id, &rs) {
            return Err(EngineError::NotFound(valid.resource_id));
        }
        if guard.requests.len() >= MAX_REQUESTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many requests on resource"));
        }
        check_no_confirmed_conflict(&guard, &valid.span, None)?;

        let request = BookingRequest {
            id: Ulid::new(),
            status: RequestStatus::Pending,
            resource_id: valid.resource_id,
            owner_id: valid.owner_id,
            group_id: valid.group_id,
            approver_id: None,
            secondary_approver_id: None,
            span: valid.span,
            title: valid.title,
            description: valid.description,
            reason: valid.reason,
        };
        let event = Event::RequestCreated {
            request: request.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::REQUESTS_CREATED_TOTAL).increment(1);
        info!(
            "request {} created on resource {} by {}",
            request.id, request.resource_id, request.owner_id
        );
        Ok(request)
    }

    /// Compare-and-set the status of a pending request.
    ///
    /// Runs under the resource write lock: the current status is read, the
    /// transition checked, and the confirmed-overlap re-check done before the
    /// event is logged, so two approvals of the same request (or of two
    /// overlapping requests) cannot both succeed.
    pub async fn update_status(&self, id: Ulid, change: StatusChange) -> Result<BookingRequest, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let (resource_id, mut guard) = self.resolve_request_write(&id).await?;

        if !self.account_exists(&change.actor) {
            return Err(EngineError::NotFound(change.actor));
        }
        if let Some(secondary) = change.secondary_approver_id
            && !self.account_exists(&secondary)
        {
            return Err(EngineError::NotFound(secondary));
        }

        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        let from = current.status;
        let span = current.span;

        if !from.can_transition_to(change.status) {
            return Err(EngineError::InvalidTransition {
                id,
                current: from,
                requested: change.status,
            });
        }
        if change.status.is_confirmed() {
            check_no_confirmed_conflict(&guard, &span, Some(id))?;
        }

        let event = Event::StatusChanged {
            id,
            resource_id,
            from,
            to: change.status,
            actor: change.actor,
            secondary_approver_id: change.secondary_approver_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(
            observability::STATUS_TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => change.status.as_str()
        )
        .increment(1);
        info!("request {id}: {from} -> {} by {}", change.status, change.actor);

        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events: Vec<Event> = self
            .accounts
            .iter()
            .map(|id| Event::AccountRegistered { id: *id })
            .collect();
        events.extend(self.groups.iter().map(|id| Event::GroupRegistered { id: *id }));

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            // Current state is carried whole; replay inserts it as-is.
            for request in &guard.requests {
                events.push(Event::RequestCreated {
                    request: request.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("WAL compaction failed: {e}")))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
