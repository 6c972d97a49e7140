use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn ensure_kind(rs: &ResourceState, expected: ResourceKind) -> Result<(), EngineError> {
    if rs.kind != expected {
        return Err(EngineError::WrongResourceKind {
            id: rs.id,
            expected,
        });
    }
    Ok(())
}

/// First active reservation on the resource that overlaps `span`.
pub(crate) fn find_conflict(rs: &ResourceState, span: &Span) -> Option<Ulid> {
    rs.overlapping(span).next().map(|r| r.id)
}

pub(crate) fn check_room_free(room: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(room, span) {
        Some(conflicting) => Err(EngineError::RoomBusy {
            room_id: room.id,
            conflicting,
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_trainer_free(trainer: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(trainer, span) {
        Some(conflicting) => Err(EngineError::TrainerBusy {
            trainer_id: trainer.id,
            conflicting,
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_reservation_limit(rs: &ResourceState) -> Result<(), EngineError> {
    if rs.reservations.len() >= crate::limits::MAX_RESERVATIONS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many reservations on resource"));
    }
    Ok(())
}
