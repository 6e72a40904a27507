//! Rate limiting logic and state management.

mod cache;
mod clock;
mod engine;
mod key;
mod propagator;
mod scheduler;
mod service;
mod settings;

pub use cache::LocalCache;
pub use clock::{duration_micros, micros_to_millis, Clock, ManualClock, Micros, SystemClock};
pub use engine::{Admission, AdmissionEngine, Verdict, VisitorAttrs};
pub use key::VisitorKey;
pub use propagator::{BanMessage, BanPropagator};
pub use scheduler::{SyncScheduler, TickReport};
pub use service::RateLimitService;
pub use settings::{FailurePolicy, LimiterSettings};
