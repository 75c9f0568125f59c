//! Script-time watchdog.
//!
//! A background thread polls on a short interval and accumulates elapsed
//! time only while the script is *not* inside a host call. Once the
//! accumulated time reaches the budget it marks the run as timed out and
//! fires the interrupt callback (an epoch increment); the store's epoch
//! callback then traps the script at its next check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// State shared between a running script and its watchdog.
#[derive(Debug, Default)]
pub struct WatchdogState {
    in_host_call: AtomicBool,
    timed_out: AtomicBool,
    script_micros: AtomicU64,
}

impl WatchdogState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the start of a host call; time is not accounted until the
    /// returned guard is dropped.
    pub fn enter_host_call(&self) -> HostCallGuard<'_> {
        self.in_host_call.store(true, Ordering::SeqCst);
        HostCallGuard { state: self }
    }

    pub fn in_host_call(&self) -> bool {
        self.in_host_call.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Accounted pure script time so far.
    pub fn script_time(&self) -> Duration {
        Duration::from_micros(self.script_micros.load(Ordering::SeqCst))
    }

    fn account(&self, delta: Duration) -> Duration {
        let micros = delta.as_micros().min(u64::MAX as u128) as u64;
        let total = self.script_micros.fetch_add(micros, Ordering::SeqCst) + micros;
        Duration::from_micros(total)
    }
}

/// Resets the in-host-call flag when dropped.
pub struct HostCallGuard<'a> {
    state: &'a WatchdogState,
}

impl Drop for HostCallGuard<'_> {
    fn drop(&mut self) {
        self.state.in_host_call.store(false, Ordering::SeqCst);
    }
}

/// Handle to a running watchdog thread. Stopped on [`Watchdog::finish`]
/// or drop.
pub struct Watchdog {
    state: Arc<WatchdogState>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start watching. `on_timeout` runs once, on the watchdog thread.
    pub fn spawn(
        state: Arc<WatchdogState>,
        budget: Duration,
        poll_interval: Duration,
        on_timeout: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_state = state.clone();
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("agora-watchdog".into())
            .spawn(move || {
                let mut last = Instant::now();
                while !thread_stop.load(Ordering::SeqCst) {
                    std::thread::park_timeout(poll_interval);
                    let now = Instant::now();
                    let delta = now.duration_since(last);
                    last = now;

                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if thread_state.in_host_call() {
                        continue;
                    }
                    if thread_state.account(delta) >= budget {
                        thread_state.timed_out.store(true, Ordering::SeqCst);
                        on_timeout();
                        break;
                    }
                }
            })?;

        Ok(Self {
            state,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the watchdog and return the accounted script time.
    pub fn finish(mut self) -> Duration {
        self.shutdown();
        self.state.script_time()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
