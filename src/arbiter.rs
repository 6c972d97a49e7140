//! Request-level orchestration over the [`Engine`].
//!
//! The arbiter owns no reservation state. It turns typed requests into
//! validated spans, calls the engine, retries rejections the engine marks as
//! retriable, and records one metric sample per request.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, RETRIES_TOTAL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

fn span_of(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or(EngineError::InvalidInterval { start, end })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub trainer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

impl WindowRequest {
    pub fn span(&self) -> Result<Span, EngineError> {
        span_of(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupActivityRequest {
    pub room_id: Ulid,
    pub trainer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    pub name: Option<String>,
}

impl GroupActivityRequest {
    pub fn span(&self) -> Result<Span, EngineError> {
        if self.capacity == 0 {
            return Err(EngineError::InvalidCapacity(self.capacity));
        }
        span_of(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

impl SessionRequest {
    pub fn span(&self) -> Result<Span, EngineError> {
        span_of(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentRequest {
    pub member_id: Ulid,
    pub activity_id: Ulid,
}

pub struct BookingArbiter {
    engine: Arc<Engine>,
    retry: RetryPolicy,
    compact_threshold: u64,
}

impl BookingArbiter {
    pub fn new(engine: Arc<Engine>, retry: RetryPolicy, compact_threshold: u64) -> Self {
        Self {
            engine,
            retry,
            compact_threshold,
        }
    }

    /// Create the data directory and open (replaying) the store inside it.
    pub fn open(config: &Config) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Engine::with_lock_timeout(config.wal_path(), config.lock_timeout)?;
        info!("roster store opened at {}", config.data_dir.display());
        Ok(Self::new(
            Arc::new(engine),
            config.retry.clone(),
            config.compact_threshold,
        ))
    }

    /// Process entry point: read `ROSTER_*` settings, install the tracing
    /// subscriber, start the Prometheus listener when `ROSTER_METRICS_PORT`
    /// is set, then [`open`](Self::open) the store.
    ///
    /// Embedders that own their subscriber or recorder call `open` instead.
    pub fn from_env() -> std::io::Result<Self> {
        let config = Config::from_env();
        observability::init_tracing();
        observability::init_metrics(config.metrics_port).map_err(std::io::Error::other)?;
        Self::open(&config)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn declare_availability(
        &self,
        req: &WindowRequest,
    ) -> Result<AvailabilityWindow, EngineError> {
        let op = "declare_availability";
        let span = self.validated(op, req.span())?;
        let engine = &self.engine;
        let trainer_id = req.trainer_id;
        self.run(op, move || engine.declare_window(trainer_id, span))
            .await
    }

    pub async fn book_group_activity(
        &self,
        req: &GroupActivityRequest,
    ) -> Result<GroupActivity, EngineError> {
        let op = "book_group_activity";
        let span = self.validated(op, req.span())?;
        let engine = &self.engine;
        let (room_id, trainer_id, capacity) = (req.room_id, req.trainer_id, req.capacity);
        let name = req.name.clone();
        self.run(op, move || {
            engine.commit_group_activity(room_id, trainer_id, span, capacity, name.clone())
        })
        .await
    }

    pub async fn book_session(&self, req: &SessionRequest) -> Result<OneToOneSession, EngineError> {
        let op = "book_session";
        let span = self.validated(op, req.span())?;
        let engine = &self.engine;
        let (member_id, trainer_id, room_id) = (req.member_id, req.trainer_id, req.room_id);
        self.run(op, move || {
            engine.commit_one_to_one_session(member_id, trainer_id, room_id, span)
        })
        .await
    }

    pub async fn cancel_session(&self, session_id: Ulid) -> Result<OneToOneSession, EngineError> {
        let engine = &self.engine;
        self.run("cancel_session", move || engine.cancel_session(session_id))
            .await
    }

    pub async fn complete_session(&self, session_id: Ulid) -> Result<OneToOneSession, EngineError> {
        let engine = &self.engine;
        self.run("complete_session", move || engine.complete_session(session_id))
            .await
    }

    pub async fn enroll(&self, req: &EnrollmentRequest) -> Result<Enrollment, EngineError> {
        let engine = &self.engine;
        let EnrollmentRequest {
            member_id,
            activity_id,
        } = *req;
        self.run("enroll", move || engine.enroll(member_id, activity_id))
            .await
    }

    pub async fn unenroll(&self, req: &EnrollmentRequest) -> Result<(), EngineError> {
        let engine = &self.engine;
        let EnrollmentRequest {
            member_id,
            activity_id,
        } = *req;
        self.run("unenroll", move || engine.unenroll(member_id, activity_id))
            .await
    }

    /// Record a request that failed validation before reaching the engine.
    fn validated<T>(&self, operation: &'static str, checked: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &checked {
            debug!("{operation} rejected before commit: {e}");
            metrics::counter!(REQUESTS_TOTAL, "operation" => operation, "outcome" => e.reason())
                .increment(1);
        }
        checked
    }

    /// Run one engine call, retrying retriable rejections per the policy.
    async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut tries = 0u32;

        let result = loop {
            tries += 1;
            match attempt().await {
                Err(e) if e.is_retriable() && tries < max_attempts => {
                    warn!("{operation}: {e} (attempt {tries}/{max_attempts})");
                    metrics::counter!(RETRIES_TOTAL, "operation" => operation).increment(1);
                    tokio::time::sleep(self.retry.backoff * tries).await;
                }
                other => break other,
            }
        };

        metrics::histogram!(REQUEST_DURATION_SECONDS, "operation" => operation)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            REQUESTS_TOTAL,
            "operation" => operation,
            "outcome" => observability::outcome_label(&result)
        )
        .increment(1);

        match &result {
            Ok(_) => self.maybe_compact().await,
            Err(e) => debug!("{operation} rejected: {e}"),
        }
        result
    }

    async fn maybe_compact(&self) {
        if self.compact_threshold == 0 {
            return;
        }
        if self.engine.wal_appends_since_compact().await < self.compact_threshold {
            return;
        }
        if let Err(e) = self.engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
