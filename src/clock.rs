//! A test seam for "now", following the verifier's requirement that expiry checks use an injected clock rather than calling
//! the system clock directly.

use chrono::{DateTime, Utc};

/// Anything that can answer "what time is it".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real-world clock, used by the engine outside of tests.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns a fixed instant, for deterministic tests of
/// expiry/rollback/rotation behavior.
#[derive(Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
