use std::time::Duration;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const FIRST_SLEEP: Duration = Duration::from_micros(50);

/// Spin, then yield, then sleep with exponential growth up to a bound.
///
/// The encoding worker polls its queue instead of blocking on it: frames
/// arrive tens of milliseconds apart and a blocking wake-up adds its own
/// latency to every hand-off. Spinning costs CPU while the queue is empty,
/// so after a few rounds the backoff sleeps, never longer than `max_sleep`.
/// An idle worker therefore wakes about once per `max_sleep`.
pub struct SpinBackoff {
    step: u32,
    max_sleep: Duration,
}

impl SpinBackoff {
    pub fn new(max_sleep: Duration) -> Self {
        Self { step: 0, max_sleep }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// What the next [`snooze`](Self::snooze) will sleep for, if anything.
    pub fn next_sleep(&self) -> Option<Duration> {
        if self.step <= YIELD_LIMIT {
            return None;
        }
        let shift = (self.step - YIELD_LIMIT - 1).min(16);
        Some((FIRST_SLEEP * (1 << shift)).min(self.max_sleep))
    }

    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if let Some(sleep) = self.next_sleep() {
            std::thread::sleep(sleep);
        } else {
            std::thread::yield_now();
        }
        if self.step <= YIELD_LIMIT + 16 {
            self.step += 1;
        }
    }
}
