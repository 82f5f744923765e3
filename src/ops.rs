//! Architecture vPMU operations
//!
//! The generic vPMU hooks on [`Vcpu`] dispatch through this table once a
//! backend has installed itself during initialization.

use crate::dump::VpmuDump;
use crate::vcpu::Vcpu;

/// Result of per-vCPU vPMU initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Shadow context allocated and backend installed
    Enabled,
    /// vPMU is off on this host; the guest runs without one
    Disabled,
}

/// Result of a scheduler-driven save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Counting stopped, state left in hardware
    Stopped,
    /// Hardware state copied back into the shadow
    Saved,
}

/// Backend operation set
pub trait ArchVpmuOps: Send + Sync {
    /// Trapped WRMSR; returns whether the access was handled.
    fn do_wrmsr(&self, vcpu: &mut Vcpu, msr: u32, value: u64) -> bool;
    /// Trapped RDMSR; `None` if the access was not handled.
    fn do_rdmsr(&self, vcpu: &mut Vcpu, msr: u32) -> Option<u64>;
    /// PMU interrupt; returns whether it was consumed.
    fn do_interrupt(&self, vcpu: &mut Vcpu) -> bool;
    fn destroy(&self, vcpu: &mut Vcpu);
    fn save(&self, vcpu: &mut Vcpu) -> SaveOutcome;
    fn load(&self, vcpu: &mut Vcpu);
    fn dump(&self, vcpu: &Vcpu) -> VpmuDump;
}
