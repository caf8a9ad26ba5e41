// Background auto-tune worker: a dedicated thread that wakes on the tune
// interval and adjusts cache capacities. Cancellation is a stop flag
// checked between short sleep slices; shutdown always joins the thread.
// The worker performs no I/O.

use crate::cache::CacheEngine;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub struct Tuner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Tuner {
    /// Spawn the worker thread. It calls [`CacheEngine::tune`] once per
    /// `interval` until stopped.
    pub fn spawn(engine: Arc<CacheEngine>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("tierdb-tuner".to_string())
            .spawn(move || {
                debug!(interval_secs = interval.as_secs(), "auto-tune worker started");
                'run: loop {
                    let mut slept = Duration::ZERO;
                    while slept < interval {
                        if flag.load(Ordering::Relaxed) {
                            break 'run;
                        }
                        let nap = SLEEP_SLICE.min(interval - slept);
                        std::thread::sleep(nap);
                        slept += nap;
                    }
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    engine.tune();
                }
                debug!("auto-tune worker stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the worker and join it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.stop();
    }
}
