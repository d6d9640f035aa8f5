//! Utilities for testing code built on this crate: an in-memory radio, connected pairs of fake
//!  connections and helpers for asserting on background activity. They are used by the crate's
//!  own tests, but they are also exported for application testing, which is why this is regular
//!  (non-#[cfg(test)]) code.

pub mod connection;
pub mod radio;

use std::time::Duration;


/// Poll `condition` until it holds, panicking after a generous timeout. Links and discovery do
///  their work in background tasks, so tests can not assert on the outcome right away.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition did not become true in time");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
