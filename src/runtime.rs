// src/runtime.rs
//
// Process-wide shutdown flag and the bounded-grace join policy shared by
// every adapter task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Monotonic shutdown flag observed by every loop. Reads are acquire and
/// the single transition to `true` is release, so anything written before
/// `request()` is visible to a loop that observes the flag.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Wait for `handle` up to `grace`; a task that fails to finish in time is
/// abandoned (aborted and logged) so that shutdown always completes, even
/// when a library call inside the task wedges.
pub async fn join_with_grace<T>(handle: JoinHandle<T>, name: &str, grace: Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(_)) => info!(task = name, "task exited"),
        Ok(Err(err)) if err.is_cancelled() => info!(task = name, "task cancelled"),
        Ok(Err(err)) => warn!(task = name, error = %err, "task panicked"),
        Err(_) => {
            warn!(task = name, grace_ms = grace.as_millis() as u64, "abandoning thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_monotonic() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
        let clone = flag.clone();
        assert!(clone.is_requested());
    }

    #[tokio::test]
    async fn join_abandons_wedged_task() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        join_with_grace(handle, "wedged", Duration::from_millis(20)).await;
    }
}
