//! Per-application deploy serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

/// One async mutex per application, created lazily and held for the process
/// lifetime. Two overlapping deploy commands for the same app take turns;
/// different apps deploy concurrently.
#[derive(Default)]
pub struct AppLockRegistry {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
