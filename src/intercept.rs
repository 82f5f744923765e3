//! PMU MSR intercept control
//!
//! Fast path: counters pass through, controls trap on write so enable/disable
//! transitions are still seen. Slow path: everything traps.

use crate::flags::VpmuFlags;
use crate::layout::LayoutTable;
use crate::msrpm::MsrIntercept;
use crate::vcpu::Vcpu;

/// Install the fast-path intercepts for the whole bank.
pub fn enable_fast_path(vcpu: &mut Vcpu, layout: &LayoutTable) {
    debug_assert!(vcpu.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED));

    for (&counter, &ctrl) in layout.counters().iter().zip(layout.ctrls()) {
        vcpu.msrpm.set_intercept(counter, MsrIntercept::NONE);
        vcpu.msrpm.set_intercept(ctrl, MsrIntercept::WRITE);
    }
    vcpu.vpmu.fast_path = true;

    log::debug!("VPMU: d{}v{} fast path on", vcpu.domain_id, vcpu.id);
}

/// Trap every PMU register again.
pub fn disable_fast_path(vcpu: &mut Vcpu, layout: &LayoutTable) {
    debug_assert!(vcpu.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED));

    for (&counter, &ctrl) in layout.counters().iter().zip(layout.ctrls()) {
        vcpu.msrpm.set_intercept(counter, MsrIntercept::RW);
        vcpu.msrpm.set_intercept(ctrl, MsrIntercept::RW);
    }
    vcpu.vpmu.fast_path = false;

    log::debug!("VPMU: d{}v{} fast path off", vcpu.domain_id, vcpu.id);
}
