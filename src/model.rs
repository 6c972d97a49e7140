use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Saturates at `Ms::MAX` for spans wider than `i64` can hold.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Half-open overlap: spans that only touch at a boundary do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Inclusive containment: `self` fully contains `other`.
    pub fn covers(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// The two kinds of exclusive resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Room,
    Trainer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Room => write!(f, "room"),
            ResourceKind::Trainer => write!(f, "trainer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Scheduled)
    }

    /// Legal edges: `Scheduled -> Cancelled` and `Scheduled -> Completed`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Scheduled, SessionStatus::Cancelled)
                | (SessionStatus::Scheduled, SessionStatus::Completed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "scheduled"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupActivity {
    pub id: Ulid,
    pub room_id: Ulid,
    pub trainer_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneToOneSession {
    pub id: Ulid,
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Enrollment {
    pub member_id: Ulid,
    pub activity_id: Ulid,
}

// ── Per-key state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    GroupActivity,
    Session { member_id: Ulid },
}

/// An active commitment of a resource. Terminal sessions are never present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub span: Span,
    pub kind: ReservationKind,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Active reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Declared availability, insertion order. Always empty for rooms.
    pub windows: Vec<AvailabilityWindow>,
}

impl ResourceState {
    pub fn new(id: Ulid, kind: ResourceKind, name: Option<String>) -> Self {
        Self {
            id,
            kind,
            name,
            reservations: Vec::new(),
            windows: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// Enrollment ledger of one group activity.
#[derive(Debug, Clone)]
pub struct ActivityState {
    pub activity: GroupActivity,
    /// Enrolled members in enrollment order.
    pub members: Vec<Ulid>,
}

impl ActivityState {
    pub fn new(activity: GroupActivity) -> Self {
        Self {
            activity,
            members: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn is_enrolled(&self, member_id: &Ulid) -> bool {
        self.members.contains(member_id)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.activity.capacity as usize
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    },
    WindowDeclared {
        id: Ulid,
        trainer_id: Ulid,
        span: Span,
    },
    GroupActivityScheduled {
        id: Ulid,
        room_id: Ulid,
        trainer_id: Ulid,
        span: Span,
        capacity: u32,
        name: Option<String>,
    },
    SessionScheduled {
        id: Ulid,
        member_id: Ulid,
        trainer_id: Ulid,
        room_id: Ulid,
        span: Span,
    },
    SessionTransitioned {
        id: Ulid,
        trainer_id: Ulid,
        room_id: Ulid,
        status: SessionStatus,
    },
    MemberEnrolled {
        member_id: Ulid,
        activity_id: Ulid,
    },
    MemberUnenrolled {
        member_id: Ulid,
        activity_id: Ulid,
    },
}

impl Event {
    /// Rooms and trainers whose state this event changes.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::WindowDeclared { trainer_id, .. } => vec![*trainer_id],
            Event::GroupActivityScheduled {
                room_id, trainer_id, ..
            }
            | Event::SessionScheduled {
                room_id, trainer_id, ..
            }
            | Event::SessionTransitioned {
                room_id, trainer_id, ..
            } => vec![*room_id, *trainer_id],
            Event::ResourceCreated { .. }
            | Event::MemberEnrolled { .. }
            | Event::MemberUnenrolled { .. } => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
}
