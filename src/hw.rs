//! Physical PMU register access
//!
//! The vPMU core never executes RDMSR/WRMSR itself; it goes through
//! [`MsrAccess`] for the physical CPU the vCPU is currently scheduled on.
//! [`EmulatedPmuMsrs`] is the in-memory register file NVM uses in place of
//! real hardware.
//!
//! A context stays in the registers after an ordinary save, so each physical
//! CPU also carries a [`PmuResidency`] recording whose context that is.
//!
//! ```text
//!   A resident ──► B loads ──► A's counters parked, B resident
//!                                   │
//!   A resumes ◄─────────────────────┘  parked counters into A's shadow,
//!                                      full reload, B parked in turn
//! ```

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::msr::{fam15h_addr, is_legacy_alias};

/// RDMSR/WRMSR on the current physical CPU
pub trait MsrAccess: Send + Sync {
    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&self, msr: u32, value: u64);

    /// Which vCPU context this CPU's PMU registers hold
    fn residency(&self) -> &PmuResidency;
}

/// Last vCPU to load its PMU context on one physical CPU
///
/// vCPUs are identified by [`Vcpu::token`](crate::vcpu::Vcpu::token). When a
/// vCPU loads over a context that was only frozen, the hardware counters of
/// the displaced vCPU are parked here until it resumes or is force-saved.
#[derive(Debug, Default)]
pub struct PmuResidency {
    state: Mutex<ResidencyState>,
}

#[derive(Debug, Default)]
struct ResidencyState {
    resident: Option<u64>,
    parked: HashMap<u64, Vec<u64>>,
}

impl PmuResidency {
    pub fn new() -> Self {
        Self::default()
    }

    /// vCPU whose context is in the registers
    pub fn resident(&self) -> Option<u64> {
        self.state.lock().resident
    }

    /// Counters parked for `token`?
    pub fn has_parked(&self, token: u64) -> bool {
        self.state.lock().parked.contains_key(&token)
    }

    /// Make `token` resident. Returns the vCPU it displaced, if any.
    pub(crate) fn claim(&self, token: u64) -> Option<u64> {
        match self.state.lock().resident.replace(token) {
            Some(prev) if prev != token => Some(prev),
            _ => None,
        }
    }

    pub(crate) fn park(&self, token: u64, counters: Vec<u64>) {
        self.state.lock().parked.insert(token, counters);
    }

    pub(crate) fn take_parked(&self, token: u64) -> Option<Vec<u64>> {
        self.state.lock().parked.remove(&token)
    }

    /// Forget `token`: no longer resident, nothing parked.
    pub(crate) fn vacate(&self, token: u64) {
        let mut state = self.state.lock();
        if state.resident == Some(token) {
            state.resident = None;
        }
        state.parked.remove(&token);
    }
}

/// A recorded WRMSR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrWrite {
    pub msr: u32,
    pub value: u64,
}

/// Emulated PMU register file
///
/// On family 15h parts the legacy K7 addresses are backed by the same
/// storage as the first four extended pairs.
pub struct EmulatedPmuMsrs {
    /// Register values, keyed by backing address
    regs: RwLock<HashMap<u32, u64>>,
    /// Legacy addresses alias the extended block
    mirror_legacy: bool,
    /// Every write, in order
    write_log: Mutex<Vec<MsrWrite>>,
    residency: PmuResidency,
}

impl EmulatedPmuMsrs {
    pub fn new(mirror_legacy: bool) -> Self {
        Self {
            regs: RwLock::new(HashMap::new()),
            mirror_legacy,
            write_log: Mutex::new(Vec::new()),
            residency: PmuResidency::new(),
        }
    }

    /// Register file matching a CPU family
    pub fn for_family(family: u16) -> Self {
        Self::new(family == 0x15)
    }

    fn backing(&self, msr: u32) -> u32 {
        if self.mirror_legacy && is_legacy_alias(msr) {
            fam15h_addr(msr)
        } else {
            msr
        }
    }

    /// Writes recorded since the last [`take_writes`](Self::take_writes)
    pub fn writes(&self) -> Vec<MsrWrite> {
        self.write_log.lock().clone()
    }

    /// Drain the write log
    pub fn take_writes(&self) -> Vec<MsrWrite> {
        std::mem::take(&mut *self.write_log.lock())
    }

    /// Let a counter advance as if events were counted
    pub fn advance(&self, msr: u32, delta: u64) {
        let msr = self.backing(msr);
        let mut regs = self.regs.write();
        let value = regs.entry(msr).or_insert(0);
        *value = value.wrapping_add(delta);
    }
}

impl MsrAccess for EmulatedPmuMsrs {
    fn rdmsr(&self, msr: u32) -> u64 {
        let msr = self.backing(msr);
        self.regs.read().get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        self.write_log.lock().push(MsrWrite { msr, value });
        let msr = self.backing(msr);
        self.regs.write().insert(msr, value);
    }

    fn residency(&self) -> &PmuResidency {
        &self.residency
    }
}

impl Default for EmulatedPmuMsrs {
    fn default() -> Self {
        Self::new(false)
    }
}
