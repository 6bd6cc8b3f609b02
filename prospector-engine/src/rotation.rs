//! Proxy and persona rotation
//!
//! One [`RotationState`] exists per campaign phase run and is shared by the
//! pool's workers; its round-robin counter is the only mutable state and it
//! is atomic. Selection operates over whatever eligible slice the caller
//! passes, so health and enablement changes are observed on the next call.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

use crate::model::{Persona, Proxy, RotationStrategy};

/// Anything the rotation strategies can pick between
pub trait Rotatable {
    fn rotation_id(&self) -> Uuid;
}

impl Rotatable for Proxy {
    fn rotation_id(&self) -> Uuid {
        self.id
    }
}

impl Rotatable for Persona {
    fn rotation_id(&self) -> Uuid {
        self.id
    }
}

/// Shared rotation state for one campaign phase run
pub struct RotationState {
    strategy: RotationStrategy,
    counter: AtomicUsize,
    last_used: DashMap<Uuid, Instant>,
    /// Per-worker pin: (item, pinned-at)
    pinned: DashMap<usize, (Uuid, Instant)>,
    pin_interval: Option<Duration>,
}

impl RotationState {
    /// New rotation state; `pin_interval` keeps one pick per worker for that long
    pub fn new(strategy: RotationStrategy, pin_interval: Option<Duration>) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
            last_used: DashMap::new(),
            pinned: DashMap::new(),
            pin_interval,
        }
    }

    /// Pick an item for `domain` on behalf of `worker`
    ///
    /// Returns `None` when the eligible slice is empty; the caller decides
    /// whether that is `NoProxyAvailable` or a configuration error.
    pub fn select<'a, T: Rotatable>(
        &self,
        items: &'a [T],
        domain: &str,
        worker: usize,
    ) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }

        if let Some(interval) = self.pin_interval {
            if let Some(entry) = self.pinned.get(&worker) {
                let (id, at) = *entry;
                if at.elapsed() < interval {
                    if let Some(item) = items.iter().find(|i| i.rotation_id() == id) {
                        return Some(item);
                    }
                    // Pinned item fell out of the eligible set; fall through
                    // and pick a fresh one.
                }
            }
        }

        let choice = match self.strategy {
            RotationStrategy::RoundRobin => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % items.len();
                &items[index]
            }
            RotationStrategy::Random => {
                let index = rand::rng().random_range(0..items.len());
                &items[index]
            }
            RotationStrategy::LeastRecentlyUsed => items
                .iter()
                .min_by_key(|item| self.last_used.get(&item.rotation_id()).map(|at| *at))
                .expect("items is non-empty"),
            RotationStrategy::StickyByDomainHash => {
                let mut hasher = DefaultHasher::new();
                domain.hash(&mut hasher);
                let index = (hasher.finish() as usize) % items.len();
                &items[index]
            }
        };

        self.last_used.insert(choice.rotation_id(), Instant::now());
        if self.pin_interval.is_some() {
            self.pinned
                .insert(worker, (choice.rotation_id(), Instant::now()));
        }
        Some(choice)
    }
}
