use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{is_covered, overlapping_window};
use super::conflict::{
    check_reservation_limit, check_room_free, check_trainer_free, ensure_kind, validate_span,
};
use super::{Engine, EngineError, ResourceGuards};

fn locked<'a>(guards: &'a ResourceGuards, id: &Ulid) -> Result<&'a ResourceState, EngineError> {
    guards
        .get(id)
        .map(|g| &**g)
        .ok_or(EngineError::UnknownResource(*id))
}

impl Engine {
    /// Declare an availability window for a trainer. Windows of one trainer
    /// never overlap.
    pub async fn declare_window(
        &self,
        trainer_id: Ulid,
        span: Span,
    ) -> Result<AvailabilityWindow, EngineError> {
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_resources(&[trainer_id]).await?;

        let trainer = locked(&guards, &trainer_id)?;
        ensure_kind(trainer, ResourceKind::Trainer)?;
        if trainer.windows.len() >= MAX_WINDOWS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        if let Some(existing) = overlapping_window(trainer, &span) {
            debug!("window [{}, {}) collides with {existing}", span.start, span.end);
            return Err(EngineError::OverlappingWindow {
                trainer_id,
                existing,
            });
        }

        let id = Ulid::new();
        let event = Event::WindowDeclared {
            id,
            trainer_id,
            span,
        };
        self.persist_and_apply(&mut guards, &event).await?;
        Ok(AvailabilityWindow {
            id,
            trainer_id,
            span,
        })
    }

    /// Reserve a room and a trainer for a group activity. Room is checked
    /// before trainer.
    pub async fn commit_group_activity(
        &self,
        room_id: Ulid,
        trainer_id: Ulid,
        span: Span,
        capacity: u32,
        name: Option<String>,
    ) -> Result<GroupActivity, EngineError> {
        validate_span(&span)?;
        if capacity == 0 || capacity > MAX_ACTIVITY_CAPACITY {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("activity name too long"));
        }

        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_resources(&[room_id, trainer_id]).await?;
        {
            let room = locked(&guards, &room_id)?;
            let trainer = locked(&guards, &trainer_id)?;
            ensure_kind(room, ResourceKind::Room)?;
            ensure_kind(trainer, ResourceKind::Trainer)?;
            check_reservation_limit(room)?;
            check_reservation_limit(trainer)?;
            check_room_free(room, &span)?;
            check_trainer_free(trainer, &span)?;
        }

        let id = Ulid::new();
        let event = Event::GroupActivityScheduled {
            id,
            room_id,
            trainer_id,
            span,
            capacity,
            name: name.clone(),
        };
        self.persist_and_apply(&mut guards, &event).await?;
        info!("group activity {id} scheduled in room {room_id} with trainer {trainer_id}");
        Ok(GroupActivity {
            id,
            room_id,
            trainer_id,
            span,
            capacity,
            name,
        })
    }

    /// Reserve a trainer and a room for a one-to-one session. The trainer must
    /// have declared a window covering the whole span.
    pub async fn commit_one_to_one_session(
        &self,
        member_id: Ulid,
        trainer_id: Ulid,
        room_id: Ulid,
        span: Span,
    ) -> Result<OneToOneSession, EngineError> {
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_resources(&[room_id, trainer_id]).await?;
        {
            let trainer = locked(&guards, &trainer_id)?;
            let room = locked(&guards, &room_id)?;
            ensure_kind(trainer, ResourceKind::Trainer)?;
            ensure_kind(room, ResourceKind::Room)?;
            if !is_covered(trainer, &span) {
                return Err(EngineError::TrainerUnavailable { trainer_id, span });
            }
            check_reservation_limit(trainer)?;
            check_reservation_limit(room)?;
            check_trainer_free(trainer, &span)?;
            check_room_free(room, &span)?;
        }

        let id = Ulid::new();
        let event = Event::SessionScheduled {
            id,
            member_id,
            trainer_id,
            room_id,
            span,
        };
        self.persist_and_apply(&mut guards, &event).await?;
        info!("session {id} scheduled for member {member_id} with trainer {trainer_id}");
        Ok(OneToOneSession {
            id,
            member_id,
            trainer_id,
            room_id,
            span,
            status: SessionStatus::Scheduled,
        })
    }

    /// Move a scheduled session to a terminal status, releasing its room and
    /// trainer immediately. The record itself is kept for audit.
    pub async fn transition_session(
        &self,
        id: Ulid,
        status: SessionStatus,
    ) -> Result<OneToOneSession, EngineError> {
        // Room and trainer never change after scheduling, so they can be read
        // before locking; the status is re-read under the locks.
        let (trainer_id, room_id) = self
            .sessions
            .get(&id)
            .map(|s| (s.trainer_id, s.room_id))
            .ok_or(EngineError::SessionNotFound(id))?;

        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_resources(&[room_id, trainer_id]).await?;

        let current = self
            .sessions
            .get(&id)
            .map(|s| s.status)
            .ok_or(EngineError::SessionNotFound(id))?;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let event = Event::SessionTransitioned {
            id,
            trainer_id,
            room_id,
            status,
        };
        self.persist_and_apply(&mut guards, &event).await?;
        info!("session {id} is now {status}");
        self.sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::SessionNotFound(id))
    }

    pub async fn cancel_session(&self, id: Ulid) -> Result<OneToOneSession, EngineError> {
        self.transition_session(id, SessionStatus::Cancelled).await
    }

    pub async fn complete_session(&self, id: Ulid) -> Result<OneToOneSession, EngineError> {
        self.transition_session(id, SessionStatus::Completed).await
    }
}
