use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot stop flag that sleepers can wait on.
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    // Sleeps for `t` unless stopped first. True if stopped.
    pub fn sleep(&self, t: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_while_for(&mut stopped, |stopped| !*stopped, t);
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use crate::sync::StopSignal;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn sleep_is_cut_short() {
        let s = Arc::new(StopSignal::default());
        assert!(!s.sleep(Duration::from_millis(10)));

        let th = std::thread::spawn({
            let s = s.clone();
            move || {
                let start = Instant::now();
                (s.sleep(Duration::from_secs(10)), start.elapsed())
            }
        });
        std::thread::sleep(Duration::from_millis(50));
        s.stop();
        let (stopped, elapsed) = th.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
        assert!(s.is_stopped());
    }
}
