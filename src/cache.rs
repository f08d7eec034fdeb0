//! Per-connection cache of interpreter name lists.
//!
//! Listing every name the interpreter exports is expensive, so each session
//! remembers the answer for two fixed slots. A slot is filled at most once
//! per connection and only emptied when the session is torn down; names
//! defined after the first fetch are not seen until reconnect.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

pub type Names = Arc<Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameSlot {
    /// Names exported by the standard library.
    Base,
    /// Names built into the interpreter core.
    Core,
}

impl NameSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            NameSlot::Base => "base",
            NameSlot::Core => "core",
        }
    }
}

impl fmt::Display for NameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct NameCache {
    base: Mutex<Option<Names>>,
    core: Mutex<Option<Names>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: NameSlot) -> &Mutex<Option<Names>> {
        match slot {
            NameSlot::Base => &self.base,
            NameSlot::Core => &self.core,
        }
    }

    /// Cached names, or `None` on a miss.
    pub async fn get(&self, slot: NameSlot) -> Option<Names> {
        self.slot(slot).lock().await.clone()
    }

    /// Return the cached names, running `fetch` on a miss.
    ///
    /// The slot stays locked while `fetch` runs, so concurrent misses share
    /// one fetch. A failed fetch returns its error and leaves the slot empty,
    /// so the next caller in line fetches again. The other slot is never
    /// blocked.
    pub async fn get_or_fetch<F, Fut, E>(&self, slot: NameSlot, fetch: F) -> Result<Names, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
    {
        let mut cached = self.slot(slot).lock().await;
        if let Some(names) = cached.as_ref() {
            return Ok(Arc::clone(names));
        }

        debug!("Name cache miss for {slot}");
        let names = Arc::new(fetch().await?);
        *cached = Some(Arc::clone(&names));
        Ok(names)
    }

    /// Empty both slots.
    pub async fn evict(&self) {
        *self.base.lock().await = None;
        *self.core.lock().await = None;
    }
}
