use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot flag that sleeping threads can wait on.
#[derive(Default)]
pub(crate) struct StopSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Sleep up to `timeout`. Returns true if the signal is set.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            let _ = self.cond.wait_for(&mut set, timeout);
        }
        *set
    }

    /// Block until the signal is set.
    pub(crate) fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_timeout_returns_early_when_triggered() {
        let signal = Arc::new(StopSignal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));

        let trigger = Arc::clone(&signal);
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();

        signal.wait();
        assert!(signal.is_set());
    }
}
