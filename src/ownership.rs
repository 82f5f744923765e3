//! Physical PMU ownership
//!
//! One PMU per physical CPU, one category of consumer driving it at a time.
//! vPMU of hardware guests and the in-host profiler compete for it; any
//! number of vCPUs of the same category may hold it together.

use std::sync::Arc;

use parking_lot::Mutex;

/// PMU consumer category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuOwner {
    /// Nobody drives the PMU
    None,
    /// Hardware virtual machine guests (vPMU)
    Hvm,
    /// In-host system-wide profiler
    Profiler,
}

#[derive(Debug)]
struct OwnerState {
    owner: PmuOwner,
    holders: u32,
}

/// Single-owner PMU arbiter
#[derive(Debug)]
pub struct PmuOwnership {
    state: Mutex<OwnerState>,
}

impl PmuOwnership {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OwnerState {
                owner: PmuOwner::None,
                holders: 0,
            }),
        }
    }

    /// Claim the PMU for `category`.
    ///
    /// Succeeds when the PMU is free or already owned by the same category.
    /// Fails without side effects when another category owns it.
    pub fn acquire(&self, category: PmuOwner) -> bool {
        debug_assert!(category != PmuOwner::None, "cannot acquire PMU for nobody");

        let mut state = self.state.lock();
        if state.owner != PmuOwner::None && state.owner != category {
            return false;
        }
        if state.owner == PmuOwner::None {
            log::debug!("PMU ownership acquired by {:?}", category);
        }
        state.owner = category;
        state.holders += 1;
        true
    }

    /// Drop one hold of `category` on the PMU.
    ///
    /// Releasing a PMU the category does not hold is a caller bug: it trips
    /// an assertion in debug builds and is ignored otherwise.
    pub fn release(&self, category: PmuOwner) {
        let mut state = self.state.lock();
        if state.owner != category || state.holders == 0 {
            debug_assert!(
                false,
                "PMU released by {:?} while owned by {:?}",
                category, state.owner
            );
            return;
        }

        state.holders -= 1;
        if state.holders == 0 {
            state.owner = PmuOwner::None;
            log::debug!("PMU ownership released by {:?}", category);
        }
    }

    /// Current owner category
    pub fn owner(&self) -> PmuOwner {
        self.state.lock().owner
    }

    /// Number of outstanding holds
    pub fn holders(&self) -> u32 {
        self.state.lock().holders
    }
}

impl Default for PmuOwnership {
    fn default() -> Self {
        Self::new()
    }
}

// Global instance (lazy initialized)
lazy_static::lazy_static! {
    /// Process-wide PMU arbiter
    pub static ref PMU_OWNERSHIP: Arc<PmuOwnership> = Arc::new(PmuOwnership::new());
}

/// Get the process-wide PMU arbiter
pub fn pmu_ownership() -> &'static Arc<PmuOwnership> {
    &PMU_OWNERSHIP
}
