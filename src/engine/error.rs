use ulid::Ulid;

use crate::model::{Ms, ResourceKind, SessionStatus, Span};

/// Coarse classification of a rejection, for callers mapping outcomes to
/// transport responses and deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Retry only with different input.
    Validation,
    /// Terminal for this input.
    Conflict,
    /// Retry with the same input.
    Concurrency,
    /// Store failure; surfaced as-is.
    Dependency,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval { start: Ms, end: Ms },
    InvalidCapacity(u32),
    InvalidTransition {
        id: Ulid,
        from: SessionStatus,
        to: SessionStatus,
    },
    WrongResourceKind { id: Ulid, expected: ResourceKind },
    LimitExceeded(&'static str),

    RoomBusy { room_id: Ulid, conflicting: Ulid },
    TrainerBusy { trainer_id: Ulid, conflicting: Ulid },
    TrainerUnavailable { trainer_id: Ulid, span: Span },
    OverlappingWindow { trainer_id: Ulid, existing: Ulid },
    CapacityExceeded { activity_id: Ulid, capacity: u32 },
    AlreadyEnrolled { member_id: Ulid, activity_id: Ulid },
    ActivityNotFound(Ulid),
    NotEnrolled { member_id: Ulid, activity_id: Ulid },
    UnknownResource(Ulid),
    SessionNotFound(Ulid),
    AlreadyExists(Ulid),

    /// The key's lock could not be taken within the lock timeout.
    ConcurrentModification(Ulid),

    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            EngineError::InvalidInterval { .. }
            | EngineError::InvalidCapacity(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::WrongResourceKind { .. }
            | EngineError::LimitExceeded(_) => RejectionKind::Validation,
            EngineError::RoomBusy { .. }
            | EngineError::TrainerBusy { .. }
            | EngineError::TrainerUnavailable { .. }
            | EngineError::OverlappingWindow { .. }
            | EngineError::CapacityExceeded { .. }
            | EngineError::AlreadyEnrolled { .. }
            | EngineError::ActivityNotFound(_)
            | EngineError::NotEnrolled { .. }
            | EngineError::UnknownResource(_)
            | EngineError::SessionNotFound(_)
            | EngineError::AlreadyExists(_) => RejectionKind::Conflict,
            EngineError::ConcurrentModification(_) => RejectionKind::Concurrency,
            EngineError::WalError(_) => RejectionKind::Dependency,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind() == RejectionKind::Concurrency
    }

    /// Short stable label, used as a metrics dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::WrongResourceKind { .. } => "wrong_resource_kind",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::RoomBusy { .. } => "room_busy",
            EngineError::TrainerBusy { .. } => "trainer_busy",
            EngineError::TrainerUnavailable { .. } => "trainer_unavailable",
            EngineError::OverlappingWindow { .. } => "overlapping_window",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::AlreadyEnrolled { .. } => "already_enrolled",
            EngineError::ActivityNotFound(_) => "activity_not_found",
            EngineError::NotEnrolled { .. } => "not_enrolled",
            EngineError::UnknownResource(_) => "unknown_resource",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ConcurrentModification(_) => "concurrent_modification",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): end must be after start")
            }
            EngineError::InvalidCapacity(cap) => write!(f, "invalid capacity: {cap}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "session {id} cannot move from {from} to {to}")
            }
            EngineError::WrongResourceKind { id, expected } => {
                write!(f, "resource {id} is not a {expected}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::RoomBusy { room_id, conflicting } => {
                write!(f, "room {room_id} is booked by {conflicting}")
            }
            EngineError::TrainerBusy {
                trainer_id,
                conflicting,
            } => write!(f, "trainer {trainer_id} is booked by {conflicting}"),
            EngineError::TrainerUnavailable { trainer_id, span } => write!(
                f,
                "trainer {trainer_id} has no availability covering [{}, {})",
                span.start, span.end
            ),
            EngineError::OverlappingWindow {
                trainer_id,
                existing,
            } => write!(
                f,
                "availability overlaps window {existing} of trainer {trainer_id}"
            ),
            EngineError::CapacityExceeded {
                activity_id,
                capacity,
            } => write!(f, "activity {activity_id} is full ({capacity} seats)"),
            EngineError::AlreadyEnrolled {
                member_id,
                activity_id,
            } => write!(f, "member {member_id} already enrolled in {activity_id}"),
            EngineError::ActivityNotFound(id) => write!(f, "activity not found: {id}"),
            EngineError::NotEnrolled {
                member_id,
                activity_id,
            } => write!(f, "member {member_id} is not enrolled in {activity_id}"),
            EngineError::UnknownResource(id) => write!(f, "unknown resource: {id}"),
            EngineError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ConcurrentModification(id) => {
                write!(f, "concurrent modification on {id}, retry")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
