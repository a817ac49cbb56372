//! Per-image mutual exclusion inside one process.
//!
//! The artifact write and the record upsert go to two stores, so two
//! invocations for the same image could otherwise interleave them and leave
//! one invocation's thumbnail next to the other's record. Holding the image's
//! lock across both writes keeps the pair together; different images never
//! contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ImageLocks {
    held: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Releases the image on drop and forgets its entry once nobody else
/// waits for it.
pub struct ImageGuard<'a> {
    locks: &'a ImageLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> ImageGuard<'_> {
        let entry = {
            let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(held.entry(name.to_string()).or_default())
        };
        let guard = entry.lock_owned().await;
        ImageGuard {
            locks: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Images currently locked or waited on.
    pub fn len(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ImageGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if held
            .get(&self.name)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            held.remove(&self.name);
        }
    }
}
