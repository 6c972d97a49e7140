use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::{ensure_kind, validate_span};
use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    fn resource(&self, id: Ulid) -> Result<SharedResourceState, EngineError> {
        self.get_resource(&id).ok_or(EngineError::UnknownResource(id))
    }

    /// True iff no active reservation on the resource overlaps `span`.
    /// Cancelled and completed sessions never count.
    pub async fn check_resource_free(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        span: Span,
    ) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        ensure_kind(&guard, kind)?;
        Ok(guard.overlapping(&span).next().is_none())
    }

    /// Active reservations on the resource overlapping `span`, by start.
    pub async fn conflicts(&self, resource_id: Ulid, span: Span) -> Result<Vec<Reservation>, EngineError> {
        validate_span(&span)?;
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&span).cloned().collect())
    }

    pub async fn is_covered(&self, trainer_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let rs = self.resource(trainer_id)?;
        let guard = rs.read().await;
        ensure_kind(&guard, ResourceKind::Trainer)?;
        Ok(availability::is_covered(&guard, &span))
    }

    /// Declared windows in insertion order.
    pub async fn list_windows(&self, trainer_id: Ulid) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let rs = self.resource(trainer_id)?;
        let guard = rs.read().await;
        ensure_kind(&guard, ResourceKind::Trainer)?;
        Ok(guard.windows.clone())
    }

    /// Bookable time of a trainer within `[query_start, query_end)`.
    pub async fn free_spans(
        &self,
        trainer_id: Ulid,
        query_start: Ms,
        query_end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = Span::checked(query_start, query_end).ok_or(EngineError::InvalidInterval {
            start: query_start,
            end: query_end,
        })?;
        if query.start < MIN_VALID_TIMESTAMP_MS || query.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self.resource(trainer_id)?;
        let guard = rs.read().await;
        ensure_kind(&guard, ResourceKind::Trainer)?;
        Ok(availability::free_spans(&guard, &query))
    }

    /// Every active reservation on the resource, by start.
    pub async fn schedule(&self, resource_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    pub fn get_session(&self, id: Ulid) -> Option<OneToOneSession> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub async fn get_group_activity(&self, id: Ulid) -> Option<GroupActivity> {
        let st = self.get_activity(&id)?;
        let guard = st.read().await;
        Some(guard.activity.clone())
    }

    /// All sessions of a member, any status, by start.
    pub fn sessions_for_member(&self, member_id: Ulid) -> Vec<OneToOneSession> {
        self.sessions_where(|s| s.member_id == member_id)
    }

    /// All sessions of a trainer, any status, by start.
    pub fn sessions_for_trainer(&self, trainer_id: Ulid) -> Vec<OneToOneSession> {
        self.sessions_where(|s| s.trainer_id == trainer_id)
    }

    fn sessions_where(&self, pred: impl Fn(&OneToOneSession) -> bool) -> Vec<OneToOneSession> {
        let mut out: Vec<OneToOneSession> = self
            .sessions
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| (s.span.start, s.id));
        out
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let states: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for rs in states {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
