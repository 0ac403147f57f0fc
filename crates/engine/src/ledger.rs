//! Resource ledger - admission control over named capacity dimensions.
//!
//! The ledger is the one piece of shared mutable state in the engine. Every
//! mutation happens inside a single `std::sync::Mutex` critical section that
//! is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smartq_core::ResourceRequirements;
use tracing::{error, warn};

#[derive(Debug, Default)]
struct LedgerState {
    total: BTreeMap<String, u64>,
    used: BTreeMap<String, u64>,
}

impl LedgerState {
    fn used(&self, dimension: &str) -> u64 {
        self.used.get(dimension).copied().unwrap_or(0)
    }

    /// Unknown dimensions have zero capacity.
    fn total(&self, dimension: &str) -> u64 {
        self.total.get(dimension).copied().unwrap_or(0)
    }

    /// Only [`ResourceLedger::rebuild`] can push usage past a total.
    fn overcommitted(&self) -> bool {
        self.used.iter().any(|(dimension, used)| *used > self.total(dimension))
    }

    fn fits(&self, req: &ResourceRequirements) -> bool {
        if self.overcommitted() {
            return false;
        }
        req.iter().all(|(dimension, quantity)| {
            quantity == 0
                || self
                    .used(dimension)
                    .checked_add(quantity)
                    .is_some_and(|after| after <= self.total(dimension))
        })
    }
}

/// Tracks total and used capacity per resource dimension.
#[derive(Debug)]
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    /// Create a ledger with the given totals and nothing in use.
    pub fn new(total: BTreeMap<String, u64>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                total,
                used: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reserve `req` if every dimension has headroom.
    ///
    /// Returns `false` and changes nothing otherwise.
    pub fn try_allocate(&self, req: &ResourceRequirements) -> bool {
        let mut state = self.lock();
        if !state.fits(req) {
            return false;
        }
        for (dimension, quantity) in req.iter().filter(|(_, q)| *q > 0) {
            *state.used.entry(dimension.to_string()).or_insert(0) += quantity;
        }
        true
    }

    /// Return `req` to the pool.
    pub fn release(&self, req: &ResourceRequirements) {
        let mut state = self.lock();
        for (dimension, quantity) in req.iter().filter(|(_, q)| *q > 0) {
            let used = state.used.entry(dimension.to_string()).or_insert(0);
            if *used < quantity {
                error!(dimension, used = *used, released = quantity, "Release exceeds usage, clamping to zero");
                *used = 0;
            } else {
                *used -= quantity;
            }
        }
    }

    /// Reserve `req` behind a guard that releases it exactly once.
    pub fn reserve(self: &Arc<Self>, req: &ResourceRequirements) -> Option<Reservation> {
        self.try_allocate(req).then(|| Reservation {
            ledger: Arc::clone(self),
            requirements: req.clone(),
            released: false,
        })
    }

    /// Amount of `dimension` currently in use.
    pub fn used(&self, dimension: &str) -> u64 {
        self.lock().used(dimension)
    }

    /// Recompute usage from the requirements of jobs known to be running.
    ///
    /// Jobs admitted under a larger configuration can leave usage above a
    /// total. The ledger then admits nothing at all until releases bring
    /// every dimension back within capacity.
    pub fn rebuild<'a>(&self, running: impl IntoIterator<Item = &'a ResourceRequirements>) {
        let mut used: BTreeMap<String, u64> = BTreeMap::new();
        for req in running {
            for (dimension, quantity) in req.iter() {
                let slot = used.entry(dimension.to_string()).or_insert(0);
                *slot = slot.saturating_add(quantity);
            }
        }

        let mut state = self.lock();
        for (dimension, quantity) in &used {
            let total = state.total(dimension);
            if *quantity > total {
                warn!(dimension = %dimension, used = quantity, total, "Running jobs exceed configured capacity, admission paused");
            }
        }
        state.used = used;
    }
}

/// Resources held by one admitted job.
///
/// Released on [`Reservation::release`] or when dropped, whichever comes
/// first.
#[must_use = "dropping a reservation releases it immediately"]
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<ResourceLedger>,
    requirements: ResourceRequirements,
    released: bool,
}

impl Reservation {
    /// Give the resources back.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.ledger.release(&self.requirements);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}
