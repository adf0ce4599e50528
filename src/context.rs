//! Shared runtime state.
//!
//! One [`RuntimeContext`] is constructed at startup and passed explicitly
//! to every long-lived role; there is no ambient global lookup. Ownership
//! and synchronization per field group:
//!
//! - each media class owns a [`MediaRuntime`]: its device registry and its
//!   newly-arrived buffer, each behind a mutex, plus the condition
//!   variable the server uses to wake that class's pipeline (paired with
//!   the arrivals mutex);
//! - the report store sits behind one mutex shared by every producer; the
//!   read-modify-rewrite sequence runs entirely under it;
//! - `processing_done` is an auto-resetting notification for passive
//!   observers; every observer waits with a timeout so a missed signal
//!   self-heals within a bounded window;
//! - `stop` is the cooperative shutdown flag checked between blocking
//!   calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::registry::DeviceRegistry;
use crate::report::ReportStore;

/// Media classes served by the station.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Video,
}

impl MediaClass {
    pub fn label(&self) -> &'static str {
        match self {
            MediaClass::Image => "image",
            MediaClass::Video => "video",
        }
    }
}

/// Lock, recovering the guard when a holder panicked mid-update.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-media-class shared state: registry, arrival buffer and the wakeup
/// condition variable pairing with the buffer's mutex.
pub struct MediaRuntime {
    pub class: MediaClass,
    pub registry: Mutex<DeviceRegistry>,
    arrivals: Mutex<Vec<String>>,
    wakeup: Condvar,
}

impl MediaRuntime {
    pub fn new(class: MediaClass, offline_timeout: u64, cycle_timeout: u64, now: u64) -> Self {
        Self {
            class,
            registry: Mutex::new(DeviceRegistry::new(offline_timeout, cycle_timeout, now)),
            arrivals: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
        }
    }

    /// Append a freshly received UID and wake the pipeline.
    pub fn push_arrival(&self, uid: &str) {
        let mut arrivals = lock_unpoisoned(&self.arrivals);
        arrivals.push(uid.to_string());
        self.wakeup.notify_all();
    }

    /// Wake the pipeline without recording an arrival (shutdown, tests).
    pub fn notify(&self) {
        let _arrivals = lock_unpoisoned(&self.arrivals);
        self.wakeup.notify_all();
    }

    /// Block until woken or until `timeout` elapses.
    ///
    /// Spurious wakeups are fine: the pipeline re-checks for pending files
    /// after every return.
    pub fn wait_for_wakeup(&self, timeout: Duration) {
        let arrivals = lock_unpoisoned(&self.arrivals);
        drop(
            self.wakeup
                .wait_timeout(arrivals, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0),
        );
    }

    /// Take the whole newly-arrived buffer.
    pub fn drain_arrivals(&self) -> Vec<String> {
        let mut arrivals = lock_unpoisoned(&self.arrivals);
        std::mem::take(&mut *arrivals)
    }

    pub fn arrival_count(&self) -> usize {
        lock_unpoisoned(&self.arrivals).len()
    }
}

/// Auto-resetting "processing done" notification.
///
/// `set` releases every current waiter; the first consumer to observe the
/// signal clears it again. Observers always pass a timeout, so a missed
/// signal costs at most one timeout window.
pub struct ProcessingDone {
    flag: Mutex<bool>,
    signal: Condvar,
}

impl ProcessingDone {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = lock_unpoisoned(&self.flag);
        *flag = true;
        self.signal.notify_all();
    }

    /// Wait until the notification fires or `timeout` elapses. Returns
    /// true when the signal was observed (and consumed).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = lock_unpoisoned(&self.flag);
        if !*flag {
            let (guard, _result) = self
                .signal
                .wait_timeout(flag, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            flag = guard;
        }
        let fired = *flag;
        *flag = false;
        fired
    }
}

impl Default for ProcessingDone {
    fn default() -> Self {
        Self::new()
    }
}

/// All process-wide shared state, constructed once and passed by `Arc`.
pub struct RuntimeContext {
    pub image: MediaRuntime,
    pub video: MediaRuntime,
    pub report: Mutex<ReportStore>,
    pub processing_done: ProcessingDone,
    stop: AtomicBool,
}

impl RuntimeContext {
    pub fn new(image: MediaRuntime, video: MediaRuntime, report: ReportStore) -> Self {
        Self {
            image,
            video,
            report: Mutex::new(report),
            processing_done: ProcessingDone::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn media(&self, class: MediaClass) -> &MediaRuntime {
        match class {
            MediaClass::Image => &self.image,
            MediaClass::Video => &self.video,
        }
    }

    /// Flip the stop flag and wake everything that might be blocked on it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.image.notify();
        self.video.notify();
        self.processing_done.set();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn arrivals_buffer_drains_completely() {
        let media = MediaRuntime::new(MediaClass::Image, 120, 300, 0);
        media.push_arrival("AAFL-000001-CAFAF");
        media.push_arrival("AAFL-000002-CAFAF");
        assert_eq!(media.arrival_count(), 2);
        let drained = media.drain_arrivals();
        assert_eq!(drained.len(), 2);
        assert_eq!(media.arrival_count(), 0);
    }

    #[test]
    fn processing_done_auto_resets_on_consume() {
        let done = ProcessingDone::new();
        done.set();
        assert!(done.wait_timeout(Duration::from_millis(10)));
        assert!(!done.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn processing_done_wakes_a_blocked_waiter() {
        let done = Arc::new(ProcessingDone::new());
        let waiter = done.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        done.set();
        assert!(handle.join().expect("join"));
    }

    #[test]
    fn wakeup_returns_after_timeout_without_signal() {
        let media = MediaRuntime::new(MediaClass::Video, 120, 300, 0);
        let start = std::time::Instant::now();
        media.wait_for_wakeup(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
