use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::types::StopFlag;

/// Time source for the engine. Injected so tests never block.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock's epoch.
    fn now(&self) -> Duration;
    fn sleep(&self, d: Duration);
}

/// Wall clock whose sleeps end early once the stop flag is raised.
pub struct SystemClock {
    epoch: Instant,
    stop: StopFlag,
}

impl SystemClock {
    pub fn new(stop: StopFlag) -> Self {
        Self { epoch: Instant::now(), stop }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, d: Duration) {
        sleep_unless_stopped(&self.stop, d);
    }
}

/// Real sleep in 100 ms slices. Returns `false` if `stop` cut it short.
pub fn sleep_unless_stopped(stop: &StopFlag, d: Duration) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if stop.is_set() {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(Duration::from_millis(100)));
    }
}

/// Virtual clock: `sleep` advances time instantly.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += d;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

/// `secs` with +/-30% random jitter.
pub fn jitter(secs: f64) -> Duration {
    let spread = secs * 0.3;
    let actual = if spread > 0.0 {
        secs + rand::thread_rng().gen_range(-spread..spread)
    } else {
        secs
    };
    Duration::from_secs_f64(actual.max(0.01))
}

/// Sleep for exact milliseconds (no jitter).
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}
