use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation for one job: an explicit cancel flag plus an
/// optional wall-clock deadline. Cloned freely; all clones share the flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// `cancelled` when the flag was raised, `timed out` when the deadline
    /// passed. Explicit cancellation wins when both apply.
    pub fn cause(&self) -> Option<&'static str> {
        if self.flag.load(Ordering::SeqCst) {
            return Some("cancelled");
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some("timed out");
            }
        }
        None
    }

    /// Sleep in short slices so a cancellation interrupts the wait instead
    /// of running it out.
    pub fn sleep(&self, duration: Duration) {
        let end = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= end {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(end - now));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
