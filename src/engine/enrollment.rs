use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Seat a member in a group activity. The capacity check and the insert
    /// happen under the activity's write lock.
    pub async fn enroll(&self, member_id: Ulid, activity_id: Ulid) -> Result<Enrollment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_activity(activity_id).await?;

        if guard.is_enrolled(&member_id) {
            return Err(EngineError::AlreadyEnrolled {
                member_id,
                activity_id,
            });
        }
        if guard.is_full() {
            debug!("activity {activity_id} full at {}", guard.count());
            return Err(EngineError::CapacityExceeded {
                activity_id,
                capacity: guard.activity.capacity,
            });
        }

        let event = Event::MemberEnrolled {
            member_id,
            activity_id,
        };
        self.persist_and_apply_activity(&mut guard, &event).await?;
        Ok(Enrollment {
            member_id,
            activity_id,
        })
    }

    /// Remove a member's seat. Not idempotent: a second call is `NotEnrolled`.
    pub async fn unenroll(&self, member_id: Ulid, activity_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_activity(activity_id).await?;

        if !guard.is_enrolled(&member_id) {
            return Err(EngineError::NotEnrolled {
                member_id,
                activity_id,
            });
        }

        let event = Event::MemberUnenrolled {
            member_id,
            activity_id,
        };
        self.persist_and_apply_activity(&mut guard, &event).await
    }

    pub async fn enrollment_count(&self, activity_id: Ulid) -> Result<usize, EngineError> {
        let st = self
            .get_activity(&activity_id)
            .ok_or(EngineError::ActivityNotFound(activity_id))?;
        let guard = st.read().await;
        Ok(guard.count())
    }

    /// Enrolled members in enrollment order.
    pub async fn members(&self, activity_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let st = self
            .get_activity(&activity_id)
            .ok_or(EngineError::ActivityNotFound(activity_id))?;
        let guard = st.read().await;
        Ok(guard.members.clone())
    }

    /// Every activity the member holds a seat in, ordered by activity start.
    pub async fn enrollments_for_member(&self, member_id: Ulid) -> Vec<(Enrollment, Span)> {
        let states: Vec<_> = self.activities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for st in states {
            let guard = st.read().await;
            if guard.is_enrolled(&member_id) {
                out.push((
                    Enrollment {
                        member_id,
                        activity_id: guard.activity.id,
                    },
                    guard.activity.span,
                ));
            }
        }
        out.sort_by_key(|(_, span)| span.start);
        out
    }
}
