//! Tab leases for the shared remote browser.
//!
//! One process drives a single remote-controlled browser; this registry is
//! the cross-run arbiter that keeps two runs from fighting over the same
//! logical page. A lease is scoped: acquired at the top of a browser-driven
//! stage and released on every exit path via the guard's `Drop`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use bayline_types::SourceError;

use crate::deadline::RunDeadline;

/// Exclusive ownership of one logical page.
#[derive(Debug, Clone)]
pub struct TabLease {
    pub tab_id: String,
    pub platform: String,
    pub run_id: String,
    pub acquired_at: Instant,
}

#[derive(Debug)]
pub struct TabRegistry {
    stale_after: Duration,
    leases: Mutex<HashMap<String, TabLease>>,
}

impl TabRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, tab_id: &str, platform: &str, run_id: &str) {
        let mut leases = self.leases.lock();
        leases.insert(
            tab_id.to_string(),
            TabLease {
                tab_id: tab_id.to_string(),
                platform: platform.to_string(),
                run_id: run_id.to_string(),
                acquired_at: Instant::now(),
            },
        );
    }

    /// Refreshes the lease age; called on every browser command.
    pub fn touch(&self, tab_id: &str) {
        if let Some(lease) = self.leases.lock().get_mut(tab_id) {
            lease.acquired_at = Instant::now();
        }
    }

    pub fn release(&self, tab_id: &str) -> bool {
        self.leases.lock().remove(tab_id).is_some()
    }

    /// Releases every lease owned by `run_id`; returns how many.
    pub fn release_run(&self, run_id: &str) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, lease| lease.run_id != run_id);
        before - leases.len()
    }

    pub fn leases_for_run(&self, run_id: &str) -> Vec<TabLease> {
        self.leases
            .lock()
            .values()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn stale_tabs(&self) -> Vec<TabLease> {
        let leases = self.leases.lock();
        leases
            .values()
            .filter(|l| l.acquired_at.elapsed() >= self.stale_after)
            .cloned()
            .collect()
    }

    /// Forcibly releases stale leases; returns the count.
    pub fn cleanup_stale(&self) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, lease| {
            let stale = lease.acquired_at.elapsed() >= self.stale_after;
            if stale {
                warn!(
                    target: "bayline.tabs",
                    tab_id = %lease.tab_id,
                    platform = %lease.platform,
                    run_id = %lease.run_id,
                    "releasing stale tab lease"
                );
            }
            !stale
        });
        before - leases.len()
    }

    fn holder(&self, platform: &str) -> Option<TabLease> {
        self.leases
            .lock()
            .values()
            .find(|l| l.platform == platform)
            .cloned()
    }

    fn try_acquire(&self, platform: &str, run_id: &str) -> Option<String> {
        let mut leases = self.leases.lock();
        if leases.values().any(|l| l.platform == platform) {
            return None;
        }
        let tab_id = format!("tab:{platform}:{}", uuid::Uuid::new_v4());
        leases.insert(
            tab_id.clone(),
            TabLease {
                tab_id: tab_id.clone(),
                platform: platform.to_string(),
                run_id: run_id.to_string(),
                acquired_at: Instant::now(),
            },
        );
        Some(tab_id)
    }
}

/// Waits for the platform's tab to be free, acquiring it under `deadline`.
/// Another run holding the lease past the deadline yields `TAB_CONTENDED`.
pub async fn acquire_tab(
    registry: &Arc<TabRegistry>,
    platform: &str,
    run_id: &str,
    deadline: &RunDeadline,
) -> Result<TabGuard, SourceError> {
    loop {
        registry.cleanup_stale();
        if let Some(tab_id) = registry.try_acquire(platform, run_id) {
            debug!(target: "bayline.tabs", tab_id = %tab_id, platform, run_id, "tab lease acquired");
            return Ok(TabGuard {
                registry: registry.clone(),
                tab_id,
                platform: platform.to_string(),
            });
        }
        if deadline.deadline_elapsed() || deadline.is_cancelled() {
            if let Some(holder) = registry.holder(platform) {
                debug!(
                    target: "bayline.tabs",
                    platform,
                    holder = %holder.run_id,
                    "tab contended past deadline"
                );
            }
            return Err(SourceError::TabContended);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Scoped lease: dropping the guard releases the tab on every exit path.
#[derive(Debug)]
pub struct TabGuard {
    registry: Arc<TabRegistry>,
    tab_id: String,
    platform: String,
}

impl TabGuard {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn touch(&self) {
        self.registry.touch(&self.tab_id);
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        self.registry.release(&self.tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(stale_after: Duration) -> Arc<TabRegistry> {
        Arc::new(TabRegistry::new(stale_after))
    }

    #[test]
    fn release_run_clears_all_owned_leases() {
        let reg = registry(Duration::from_secs(60));
        reg.register("t1", "prodemand", "run-1");
        reg.register("t2", "identifix", "run-1");
        reg.register("t3", "prodemand", "run-2");
        assert_eq!(reg.release_run("run-1"), 2);
        assert!(reg.leases_for_run("run-1").is_empty());
        assert_eq!(reg.leases_for_run("run-2").len(), 1);
    }

    #[test]
    fn stale_leases_are_detected_and_cleaned() {
        let reg = registry(Duration::from_millis(0));
        reg.register("t1", "prodemand", "run-1");
        assert_eq!(reg.stale_tabs().len(), 1);
        assert_eq!(reg.cleanup_stale(), 1);
        assert!(reg.stale_tabs().is_empty());
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let reg = registry(Duration::from_secs(60));
        let deadline = RunDeadline::new(Duration::from_secs(1));
        {
            let guard = acquire_tab(&reg, "prodemand", "run-1", &deadline)
                .await
                .unwrap();
            assert!(!reg.leases_for_run("run-1").is_empty());
            drop(guard);
        }
        assert!(reg.leases_for_run("run-1").is_empty());
    }

    #[tokio::test]
    async fn contended_platform_times_out_with_tab_contended() {
        let reg = registry(Duration::from_secs(60));
        let d1 = RunDeadline::new(Duration::from_secs(5));
        let _held = acquire_tab(&reg, "prodemand", "run-1", &d1).await.unwrap();

        let d2 = RunDeadline::new(Duration::from_millis(150));
        let out = acquire_tab(&reg, "prodemand", "run-2", &d2).await;
        assert_eq!(out.unwrap_err(), SourceError::TabContended);
    }

    #[tokio::test]
    async fn waiter_proceeds_once_holder_releases() {
        let reg = registry(Duration::from_secs(60));
        let d1 = RunDeadline::new(Duration::from_secs(5));
        let held = acquire_tab(&reg, "prodemand", "run-1", &d1).await.unwrap();

        let reg2 = reg.clone();
        let waiter = tokio::spawn(async move {
            let d2 = RunDeadline::new(Duration::from_secs(5));
            acquire_tab(&reg2, "prodemand", "run-2", &d2).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.platform(), "prodemand");
    }
}
