use std::time::{SystemTime, UNIX_EPOCH};

/// Time source for flow timestamps
pub trait Clock: Send + Sync {
    /// Microseconds since the UNIX epoch
    fn now_micros(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

#[cfg(test)]
pub mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock that advances by one microsecond per read
    #[derive(Debug, Default)]
    pub struct TickClock {
        now: AtomicU64,
    }

    impl TickClock {
        pub fn starting_at(now: u64) -> Self {
            Self {
                now: AtomicU64::new(now),
            }
        }

        pub fn peek(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    impl Clock for TickClock {
        fn now_micros(&self) -> u64 {
            self.now.fetch_add(1, Ordering::SeqCst)
        }
    }
}
