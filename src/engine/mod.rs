mod availability;
mod conflict;
mod enrollment;
mod error;
mod ledger;
mod queries;

pub use availability::{
    free_spans, is_covered, merge_overlapping, overlapping_window, subtract_intervals,
};
pub use error::{EngineError, RejectionKind};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedActivityState = Arc<RwLock<ActivityState>>;

/// Write guards over every resource a commit touches, keyed and acquired in id order.
pub(super) type ResourceGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before touching the file otherwise
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Write and fsync the whole batch, or none of it: on any error the log is
/// cut back to where the batch started, so no caller told `Err` can
/// reappear on replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let checkpoint = wal.checkpoint()?;
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        if let Err(rollback_err) = wal.rollback(checkpoint) {
            error!("WAL rollback after failed batch also failed: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            if result.is_ok() {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation store: per-key locked state for rooms, trainers and group
/// activities, made durable by the WAL.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) activities: DashMap<Ulid, SharedActivityState>,
    /// Every session ever scheduled, terminal ones included.
    pub(super) sessions: DashMap<Ulid, OneToOneSession>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes room/trainer registration.
    registry_lock: Mutex<()>,
    lock_timeout: Duration,
}

/// Apply an enrollment event to an activity (caller holds the lock).
fn apply_to_activity(st: &mut ActivityState, event: &Event) {
    match event {
        Event::MemberEnrolled { member_id, .. } => {
            if !st.is_enrolled(member_id) {
                st.members.push(*member_id);
            }
        }
        Event::MemberUnenrolled { member_id, .. } => {
            st.members.retain(|m| m != member_id);
        }
        _ => {}
    }
}

impl Engine {
    /// Open the store at `wal_path`, replaying any existing log.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_lock_timeout(wal_path, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            activities: DashMap::new(),
            sessions: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
            lock_timeout,
        };

        // We're the sole owner of every Arc during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.replay(event);
        }
        info!(
            "replayed {} events from {}: {} resources, {} activities, {} sessions",
            events.len(),
            wal_path.display(),
            engine.resources.len(),
            engine.activities.len(),
            engine.sessions.len()
        );

        Ok(engine)
    }

    fn replay(&self, event: &Event) {
        match event {
            Event::ResourceCreated { id, kind, name } => {
                let rs = ResourceState::new(*id, *kind, name.clone());
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::MemberEnrolled { activity_id, .. }
            | Event::MemberUnenrolled { activity_id, .. } => {
                if let Some(st) = self.get_activity(activity_id)
                    && let Ok(mut guard) = st.try_write()
                {
                    apply_to_activity(&mut guard, event);
                }
            }
            other => {
                let mut guards = ResourceGuards::new();
                for rid in other.resource_ids() {
                    if let Some(rs) = self.get_resource(&rid)
                        && let Ok(guard) = rs.try_write_owned()
                    {
                        guards.insert(rid, guard);
                    }
                }
                self.apply_to_resources(&mut guards, other);
            }
        }
    }

    /// Mutate resource state and the registries for a committed event.
    /// Caller holds the write guards of every resource the event names.
    pub(super) fn apply_to_resources(&self, guards: &mut ResourceGuards, event: &Event) {
        match event {
            Event::WindowDeclared {
                id,
                trainer_id,
                span,
            } => {
                if let Some(rs) = guards.get_mut(trainer_id) {
                    rs.windows.push(AvailabilityWindow {
                        id: *id,
                        trainer_id: *trainer_id,
                        span: *span,
                    });
                }
            }
            Event::GroupActivityScheduled {
                id,
                room_id,
                trainer_id,
                span,
                capacity,
                name,
            } => {
                for rid in [room_id, trainer_id] {
                    if let Some(rs) = guards.get_mut(rid) {
                        rs.insert_reservation(Reservation {
                            id: *id,
                            span: *span,
                            kind: ReservationKind::GroupActivity,
                        });
                    }
                }
                let activity = GroupActivity {
                    id: *id,
                    room_id: *room_id,
                    trainer_id: *trainer_id,
                    span: *span,
                    capacity: *capacity,
                    name: name.clone(),
                };
                self.activities
                    .insert(*id, Arc::new(RwLock::new(ActivityState::new(activity))));
            }
            Event::SessionScheduled {
                id,
                member_id,
                trainer_id,
                room_id,
                span,
            } => {
                for rid in [room_id, trainer_id] {
                    if let Some(rs) = guards.get_mut(rid) {
                        rs.insert_reservation(Reservation {
                            id: *id,
                            span: *span,
                            kind: ReservationKind::Session {
                                member_id: *member_id,
                            },
                        });
                    }
                }
                self.sessions.insert(
                    *id,
                    OneToOneSession {
                        id: *id,
                        member_id: *member_id,
                        trainer_id: *trainer_id,
                        room_id: *room_id,
                        span: *span,
                        status: SessionStatus::Scheduled,
                    },
                );
            }
            Event::SessionTransitioned {
                id,
                trainer_id,
                room_id,
                status,
            } => {
                if status.is_terminal() {
                    for rid in [room_id, trainer_id] {
                        if let Some(rs) = guards.get_mut(rid) {
                            rs.remove_reservation(*id);
                        }
                    }
                }
                if let Some(mut session) = self.sessions.get_mut(id) {
                    session.status = *status;
                }
            }
            // Registration and enrollments are handled outside resource state
            Event::ResourceCreated { .. }
            | Event::MemberEnrolled { .. }
            | Event::MemberUnenrolled { .. } => {}
        }
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
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, under the caller's guards.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut ResourceGuards,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_resources(guards, event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_activity(
        &self,
        st: &mut ActivityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_activity(st, event);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_activity(&self, id: &Ulid) -> Option<SharedActivityState> {
        self.activities.get(id).map(|e| e.value().clone())
    }

    /// Take write locks on every id in ascending order, each bounded by the
    /// lock timeout. Ascending order rules out lock-order deadlocks between
    /// commits that share keys.
    pub(super) async fn lock_resources(&self, ids: &[Ulid]) -> Result<ResourceGuards, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = ResourceGuards::new();
        for id in sorted {
            let rs = self
                .get_resource(&id)
                .ok_or(EngineError::UnknownResource(id))?;
            let guard = tokio::time::timeout(self.lock_timeout, rs.write_owned())
                .await
                .map_err(|_| self.lock_timed_out(id))?;
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    pub(super) async fn lock_activity(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ActivityState>, EngineError> {
        let st = self
            .get_activity(&id)
            .ok_or(EngineError::ActivityNotFound(id))?;
        tokio::time::timeout(self.lock_timeout, st.write_owned())
            .await
            .map_err(|_| self.lock_timed_out(id))
    }

    fn lock_timed_out(&self, id: Ulid) -> EngineError {
        metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        debug!("lock wait on {id} exceeded {:?}", self.lock_timeout);
        EngineError::ConcurrentModification(id)
    }

    // ── Resource registration ────────────────────────────────

    pub async fn create_room(&self, id: Ulid, name: Option<String>) -> Result<ResourceInfo, EngineError> {
        self.create_resource(id, ResourceKind::Room, name).await
    }

    pub async fn create_trainer(&self, id: Ulid, name: Option<String>) -> Result<ResourceInfo, EngineError> {
        self.create_resource(id, ResourceKind::Trainer, name).await
    }

    pub async fn create_resource(
        &self,
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    ) -> Result<ResourceInfo, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            kind,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, kind, name.clone());
        self.resources.insert(id, Arc::new(RwLock::new(rs)));
        info!("registered {kind} {id}");
        Ok(ResourceInfo { id, kind, name })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no commit can land between snapshot and swap.
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut resource_ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        resource_ids.sort();
        let mut windows = Vec::new();
        for id in &resource_ids {
            let Some(rs) = self.get_resource(id) else { continue };
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
            });
            for w in &guard.windows {
                windows.push(Event::WindowDeclared {
                    id: w.id,
                    trainer_id: w.trainer_id,
                    span: w.span,
                });
            }
        }
        events.extend(windows);

        let mut activity_ids: Vec<Ulid> = self.activities.iter().map(|e| *e.key()).collect();
        activity_ids.sort();
        for id in &activity_ids {
            let Some(st) = self.get_activity(id) else { continue };
            let guard = st.read().await;
            let a = &guard.activity;
            events.push(Event::GroupActivityScheduled {
                id: a.id,
                room_id: a.room_id,
                trainer_id: a.trainer_id,
                span: a.span,
                capacity: a.capacity,
                name: a.name.clone(),
            });
            for member_id in &guard.members {
                events.push(Event::MemberEnrolled {
                    member_id: *member_id,
                    activity_id: a.id,
                });
            }
        }

        let mut sessions: Vec<OneToOneSession> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        for s in sessions {
            events.push(Event::SessionScheduled {
                id: s.id,
                member_id: s.member_id,
                trainer_id: s.trainer_id,
                room_id: s.room_id,
                span: s.span,
            });
            if s.status.is_terminal() {
                events.push(Event::SessionTransitioned {
                    id: s.id,
                    trainer_id: s.trainer_id,
                    room_id: s.room_id,
                    status: s.status,
                });
            }
        }

        events
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
