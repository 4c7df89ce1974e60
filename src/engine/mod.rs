mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{blocked_slots, merge_overlapping};
pub use error::EngineError;
pub use store::RequestStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync; other commands wait for the batch ahead of
/// them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut next = rx.recv().await;
    while let Some(cmd) = next.take() {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Compact { events, response } => {
                let swapped = Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file());
                let _ = response.send(swapped);
                next = rx.recv().await;
                continue;
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
                next = rx.recv().await;
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        while let Ok(queued) = rx.try_recv() {
            match queued {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    next = Some(control);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);

        if next.is_none() {
            next = rx.recv().await;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let written = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so partial bytes never join the next batch.
    let flushed = wal.flush_sync();
    let outcome = written.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}

/// The request store: every resource's calendar in memory, every mutation
/// durably logged before it is applied.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Registered identities that may own or act on requests.
    pub(super) accounts: DashSet<Ulid>,
    /// Registered groups a request may be booked for.
    pub(super) groups: DashSet<Ulid>,
    /// Reverse lookup: request id → resource id
    pub(super) request_to_resource: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can land between the snapshot and the file swap.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply a request event to its resource. Caller holds the write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RequestCreated { request } => {
            index.insert(request.id, request.resource_id);
            rs.insert_request(request.clone());
        }
        Event::StatusChanged {
            id,
            to,
            actor,
            secondary_approver_id,
            ..
        } => {
            if let Some(req) = rs.get_mut(id) {
                req.status = *to;
                req.approver_id = Some(*actor);
                if secondary_approver_id.is_some() {
                    req.secondary_approver_id = *secondary_approver_id;
                }
            }
        }
        // Registrations are handled at the DashMap level, not here
        Event::ResourceRegistered { .. }
        | Event::AccountRegistered { .. }
        | Event::GroupRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            accounts: DashSet::new(),
            groups: DashSet::new(),
            request_to_resource: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Sole owner during replay: try_write cannot contend, and
        // blocking_write would panic inside the runtime.
        for event in &events {
            match event {
                Event::ResourceRegistered { id, name } => {
                    engine
                        .state
                        .entry(*id)
                        .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(*id, name.clone()))));
                }
                Event::AccountRegistered { id } => {
                    engine.accounts.insert(*id);
                }
                Event::GroupRegistered { id } => {
                    engine.groups.insert(*id);
                }
                other => {
                    let Some(rs) = event_resource_id(other).and_then(|id| engine.get_resource(&id))
                    else {
                        tracing::warn!("replay: event for unknown resource skipped");
                        continue;
                    };
                    match rs.try_write() {
                        Ok(mut guard) => apply_to_resource(&mut guard, other, &engine.request_to_resource),
                        Err(_) => {
                            return Err(io::Error::other("replay: resource lock contended"));
                        }
                    }
                }
            }
        }

        tracing::info!(
            "store loaded: {} events, {} resources, {} requests",
            events.len(),
            engine.state.len(),
            engine.request_to_resource.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("WAL write failed: {e}")))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_request(&self, request_id: &Ulid) -> Option<Ulid> {
        self.request_to_resource.get(request_id).map(|e| *e.value())
    }

    /// Whether `rs` is still the calendar registered under `id`.
    pub(super) fn is_registered(&self, id: &Ulid, rs: &SharedResourceState) -> bool {
        self.state.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    pub fn account_exists(&self, id: &Ulid) -> bool {
        self.accounts.contains(id)
    }

    pub fn group_exists(&self, id: &Ulid) -> bool {
        self.groups.contains(id)
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.request_to_resource);
        Ok(())
    }

    /// Lookup request → resource, get resource, acquire write lock.
    pub(super) async fn resolve_request_write(
        &self,
        request_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_request(request_id)
            .ok_or(EngineError::NotFound(*request_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}

/// Extract the resource_id from a request event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RequestCreated { request } => Some(request.resource_id),
        Event::StatusChanged { resource_id, .. } => Some(*resource_id),
        Event::ResourceRegistered { .. }
        | Event::AccountRegistered { .. }
        | Event::GroupRegistered { .. } => None,
    }
}
