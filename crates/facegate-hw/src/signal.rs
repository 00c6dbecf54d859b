//! Cooperative stop signal.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Clone-safe flag that, once tripped, stays tripped.
///
/// Waiters block on a condvar so a trip wakes an in-progress wait
/// immediately instead of at the end of its timeout.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every waiter.
    pub fn trip(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_tripped(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for `timeout` unless tripped first. Returns `true` if tripped.
    ///
    /// A timeout too large to represent as a deadline waits for the trip
    /// alone.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut tripped = lock(flag);
        while !*tripped {
            tripped = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match cvar.wait_timeout(tripped, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => cvar.wait(tripped).unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
        true
    }
}

// A panicking holder cannot leave the bool half-written.
fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_when_not_tripped() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_trip_wakes_waiter_early() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.trip();
        });
        let start = Instant::now();
        assert!(stop.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_timeout_waits_for_trip() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.trip();
        });
        assert!(stop.wait(Duration::from_secs(u64::MAX)));
        handle.join().unwrap();
    }

    #[test]
    fn test_tripped_signal_returns_immediately() {
        let stop = StopSignal::new();
        stop.trip();
        assert!(stop.is_tripped());
        assert!(stop.wait(Duration::from_secs(10)));
    }
}
