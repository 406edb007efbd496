//! Retry helper for SQLite lock contention
//!
//! The busy timeout covers most contention, but a deferred transaction that
//! upgrades to a writer can still fail immediately with SQLITE_BUSY. Writers
//! wrap their statement in `retry_on_lock` and retry with exponential backoff
//! until `max_wait_ms` has elapsed.

use crate::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 500;

/// Run `operation`, retrying while it fails with lock contention
pub async fn retry_on_lock<T, F, Fut>(name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let deadline = Duration::from_millis(max_wait_ms);
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = name, attempt, "Succeeded after lock retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_lock_contention() && started.elapsed() < deadline => {
                debug!(operation = name, attempt, backoff_ms, "Database locked, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                attempt += 1;
            }
            Err(e) => {
                if e.is_lock_contention() {
                    warn!(
                        operation = name,
                        attempts = attempt,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Giving up after lock contention"
                    );
                }
                return Err(e);
            }
        }
    }
}
