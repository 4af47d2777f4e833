use chrono::{DateTime, Utc};

/// Injectable wall-clock so lease expiry is testable without real sleeps,
/// the way `eden/mononoke/blobstore/test_utils/lib.rs`'s `Tickable` test
/// double drives blobstore timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// A clock a test can advance by hand, so renew/expiry logic can be
    /// exercised without sleeping.
    #[derive(Debug)]
    pub struct TestClock(Mutex<DateTime<Utc>>);

    impl TestClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self(Mutex::new(start))
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.0.lock().expect("clock mutex poisoned");
            *guard += delta;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().expect("clock mutex poisoned")
        }
    }
}
