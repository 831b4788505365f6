//! Shared dispatcher/worker state: heartbeats, current-task labels, the
//! cooperative termination flag and the run totals. No ambient singletons;
//! one record is created per run and passed by Arc.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Tasks during which a silent worker is legitimately blocked and must not
/// be treated as stalled
pub const WHITELISTED_TASKS: &[&str] = &["wait for file", "external indexer"];

pub fn task_is_whitelisted(task: &str) -> bool {
    WHITELISTED_TASKS.contains(&task)
}

/// Liveness state of one worker seat. The worker is the single writer; the
/// dispatcher only reads.
#[derive(Debug)]
pub struct WorkerHealth {
    heartbeat: AtomicU64,
    last_task: Mutex<&'static str>,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self {
            heartbeat: AtomicU64::new(0),
            last_task: Mutex::new("idle"),
        }
    }

    pub fn ping(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn set_task(&self, task: &'static str) {
        if let Ok(mut guard) = self.last_task.lock() {
            *guard = task;
        }
        self.ping();
    }

    pub fn task(&self) -> &'static str {
        self.last_task.lock().map(|g| *g).unwrap_or("unknown")
    }
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing totals for the whole run
#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    pub n_processed: u64,
    pub n_hits: u64,
    pub n_had_crystals: u64,
    pub n_crystals: u64,
    pub n_failed: u64,
}

/// State shared between the dispatcher and every worker
#[derive(Debug, Default)]
pub struct SharedState {
    terminate: AtomicBool,
    totals: Mutex<Totals>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Account one finished image
    pub fn record_image(&self, hit: bool, n_crystals: usize) {
        if let Ok(mut totals) = self.totals.lock() {
            totals.n_processed += 1;
            if hit {
                totals.n_hits += 1;
            }
            if n_crystals > 0 {
                totals.n_had_crystals += 1;
            }
            totals.n_crystals += n_crystals as u64;
        }
    }

    /// Account one image lost to a crash, stall or load failure
    pub fn record_failure(&self) {
        if let Ok(mut totals) = self.totals.lock() {
            totals.n_processed += 1;
            totals.n_failed += 1;
        }
    }

    pub fn totals(&self) -> Totals {
        self.totals.lock().map(|t| *t).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_monotonic() {
        let health = WorkerHealth::new();
        let before = health.count();
        health.ping();
        health.set_task("indexing");
        assert!(health.count() >= before + 2);
        assert_eq!(health.task(), "indexing");
    }

    #[test]
    fn whitelist_covers_the_blocking_stages() {
        assert!(task_is_whitelisted("wait for file"));
        assert!(task_is_whitelisted("external indexer"));
        assert!(!task_is_whitelisted("integration"));
    }

    #[test]
    fn totals_accumulate() {
        let shared = SharedState::new();
        shared.record_image(true, 2);
        shared.record_image(false, 0);
        shared.record_failure();
        let t = shared.totals();
        assert_eq!(t.n_processed, 3);
        assert_eq!(t.n_hits, 1);
        assert_eq!(t.n_had_crystals, 1);
        assert_eq!(t.n_crystals, 2);
        assert_eq!(t.n_failed, 1);
    }

    #[test]
    fn terminate_flag_latches() {
        let shared = SharedState::new();
        assert!(!shared.should_terminate());
        shared.request_terminate();
        assert!(shared.should_terminate());
    }
}
