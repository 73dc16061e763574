//! Concurrency limits: one global semaphore plus one small semaphore per
//! resource key (usually a database address), so a single resource never
//! sees more than a couple of concurrent operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::sync::lock;

pub const DEFAULT_TOTAL_CAPACITY: usize = 32;
pub const DEFAULT_RESOURCE_CAPACITY: usize = 2;

struct Entry {
    semaphore: Arc<Semaphore>,
    /// Waiters plus holders.
    users: usize,
}

pub struct Limits {
    global: Arc<Semaphore>,
    resource_capacity: usize,
    resources: Mutex<HashMap<String, Entry>>,
}

/// Held for the duration of one task body.
pub struct Permit {
    _global: OwnedSemaphorePermit,
    _resource: Option<(OwnedSemaphorePermit, Reservation)>,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("resource", &self._resource.as_ref().map(|(_, r)| r.key.as_str()))
            .finish_non_exhaustive()
    }
}

/// Keeps a resource entry alive; the entry is removed with its last user.
pub struct Reservation {
    limits: Arc<Limits>,
    key: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut resources = lock(&self.limits.resources);
        if let Some(entry) = resources.get_mut(&self.key) {
            entry.users -= 1;
            if entry.users == 0 {
                resources.remove(&self.key);
            }
        }
    }
}

impl Limits {
    /// Zero capacities fall back to the defaults.
    pub fn new(total_capacity: usize, resource_capacity: usize) -> Arc<Self> {
        let total = if total_capacity == 0 {
            DEFAULT_TOTAL_CAPACITY
        } else {
            total_capacity
        };
        let resource = if resource_capacity == 0 {
            DEFAULT_RESOURCE_CAPACITY
        } else {
            resource_capacity
        };
        Arc::new(Self {
            global: Arc::new(Semaphore::new(total)),
            resource_capacity: resource,
            resources: Mutex::new(HashMap::new()),
        })
    }

    /// Wait for the resource permit (if `key` is set) and then the global one.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn acquire(
        self: &Arc<Self>,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<Permit> {
        let resource = match key {
            Some(key) => {
                let semaphore = self.reserve(key);
                let reservation = Reservation {
                    limits: Arc::clone(self),
                    key: key.to_string(),
                };
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit.ok()?,
                };
                Some((permit, reservation))
            }
            None => None,
        };

        let global = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            permit = Arc::clone(&self.global).acquire_owned() => permit.ok()?,
        };

        Some(Permit {
            _global: global,
            _resource: resource,
        })
    }

    fn reserve(&self, key: &str) -> Arc<Semaphore> {
        let mut resources = lock(&self.resources);
        let entry = resources.entry(key.to_string()).or_insert_with(|| Entry {
            semaphore: Arc::new(Semaphore::new(self.resource_capacity)),
            users: 0,
        });
        entry.users += 1;
        Arc::clone(&entry.semaphore)
    }

    /// Number of resource keys with at least one waiter or holder.
    pub fn resources_in_use(&self) -> usize {
        lock(&self.resources).len()
    }

    pub fn available(&self) -> usize {
        self.global.available_permits()
    }
}
