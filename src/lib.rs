pub mod arbiter;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;

pub use arbiter::{
    BookingArbiter, EnrollmentRequest, GroupActivityRequest, RetryPolicy, SessionRequest,
    WindowRequest,
};
pub use config::Config;
pub use engine::{Engine, EngineError, RejectionKind};
