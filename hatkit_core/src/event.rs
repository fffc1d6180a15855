//! Set/clear flag with blocking waits
//!
//! Background loops are gated by an [`Event`]: the owner sets it to let the
//! loop run and clears it to ask the loop to stop; a loop acknowledges its
//! exit by setting the event again, so the owner can wait on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct EventState {
    flag: Mutex<bool>,
    changed: Condvar,
}

/// Shareable boolean flag; clones refer to the same flag
#[derive(Debug, Clone, Default)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut flag = self.state.flag.lock();
        *flag = true;
        self.state.changed.notify_all();
    }

    pub fn clear(&self) {
        let mut flag = self.state.flag.lock();
        *flag = false;
        self.state.changed.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.flag.lock()
    }

    /// Block until the flag is set
    pub fn wait(&self) {
        let mut flag = self.state.flag.lock();
        while !*flag {
            self.state.changed.wait(&mut flag);
        }
    }

    /// Block until the flag is set or `timeout` elapses; returns the flag
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.state.flag.lock();
        while !*flag {
            if self.state.changed.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_wakes_waiter() {
        let event = Event::new();
        let waiter = event.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.set();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }
}
