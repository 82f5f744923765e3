//! AMD SVM vPMU backend
//!
//! ## Register access
//!
//! ```text
//!   control write ─┬─ HVM: force GUEST_ONLY
//!                  ├─ EN set,   !RUNNING ─► acquire ownership ─► RUNNING, fast path on
//!                  │                              └─ denied ─► write dropped
//!                  ├─ EN clear,  RUNNING ─► !RUNNING, fast path off, release
//!                  ├─ !LOADED or FROZEN ─► full context load
//!                  └─ update shadow, write hardware
//! ```
//!
//! ## Scheduling
//!
//! - **load**: controls only when the context is still in hardware, full load
//!   otherwise.
//! - **save**: an ordinary save just zeroes the controls and marks the context
//!   `FROZEN`; `RUNNING` and ownership are kept. A forced save copies the
//!   counters back into the shadow.
//!
//! A frozen context is left in the registers, so every full load claims the
//! physical CPU first and parks the counters of the vCPU it displaces. A vCPU
//! that finds itself displaced takes its parked counters back and treats its
//! context as not loaded.

use std::sync::Arc;

use crate::context::AmdPmuContext;
use crate::dump::{RegisterDump, VpmuDump};
use crate::error::{VpmuError, VpmuResult};
use crate::flags::VpmuFlags;
use crate::host::VpmuHost;
use crate::intercept::{disable_fast_path, enable_fast_path};
use crate::layout::LayoutTable;
use crate::msr::{evntsel, PmuRegType};
use crate::ops::{ArchVpmuOps, InitOutcome, SaveOutcome};
use crate::ownership::{PmuOwner, PmuOwnership};
use crate::vcpu::Vcpu;

/// AMD vPMU operation set
pub struct AmdVpmu {
    layout: Arc<LayoutTable>,
    ownership: Arc<PmuOwnership>,
}

impl AmdVpmu {
    pub fn new(layout: Arc<LayoutTable>, ownership: Arc<PmuOwnership>) -> Self {
        Self { layout, ownership }
    }

    /// Allocate the shadow context of `vcpu` and install the backend.
    ///
    /// A host without vPMU yields [`InitOutcome::Disabled`]; a failed
    /// allocation leaves the vCPU without a vPMU and is reported as
    /// [`VpmuError::InsufficientMemory`].
    pub fn initialise(vcpu: &mut Vcpu, host: &VpmuHost) -> VpmuResult<InitOutcome> {
        Self::initialise_with(vcpu, host, AmdPmuContext::try_new)
    }

    /// [`initialise`](Self::initialise) with the shadow allocator supplied
    /// by the caller. `alloc` gets the bank size.
    pub(crate) fn initialise_with<F>(vcpu: &mut Vcpu, host: &VpmuHost, alloc: F) -> VpmuResult<InitOutcome>
    where
        F: FnOnce(usize) -> Option<AmdPmuContext>,
    {
        if !host.is_enabled() {
            return Ok(InitOutcome::Disabled);
        }

        let layout = host.layout();
        let ctxt = match alloc(layout.bank_size()) {
            Some(ctxt) => ctxt,
            None => {
                log::warn!(
                    "Insufficient memory for PMU, PMU feature is unavailable on domain {} vcpu {}",
                    vcpu.domain_id,
                    vcpu.id
                );
                return Err(VpmuError::InsufficientMemory {
                    domain_id: vcpu.domain_id,
                    vcpu_id: vcpu.id,
                });
            }
        };

        let vpmu = &mut vcpu.vpmu;
        vpmu.context = Some(ctxt);
        vpmu.fast_path = false;
        vpmu.clear_all();
        vpmu.install_ops(Arc::new(AmdVpmu::new(layout.clone(), host.ownership().clone())));
        vpmu.set(VpmuFlags::CONTEXT_ALLOCATED);

        log::debug!("VPMU: d{}v{} context allocated", vcpu.domain_id, vcpu.id);
        Ok(InitOutcome::Enabled)
    }

    /// Shadow to hardware, every register.
    fn context_load(&self, vcpu: &Vcpu) {
        let Some(ctxt) = vcpu.vpmu.context.as_ref() else {
            return;
        };
        self.claim_pcpu(vcpu);
        for i in 0..self.layout.bank_size() {
            vcpu.pcpu.wrmsr(self.layout.counters()[i], ctxt.counters()[i]);
            vcpu.pcpu.wrmsr(self.layout.ctrls()[i], ctxt.ctrls()[i]);
        }
    }

    /// Hardware counters to shadow. Controls are already current.
    fn context_save(&self, vcpu: &mut Vcpu) {
        let Some(ctxt) = vcpu.vpmu.context.as_mut() else {
            return;
        };
        for (i, &msr) in self.layout.counters().iter().enumerate() {
            ctxt.counters_mut()[i] = vcpu.pcpu.rdmsr(msr);
        }
    }

    /// Take over the physical CPU, parking the counters of the vCPU whose
    /// context is still in the registers.
    fn claim_pcpu(&self, vcpu: &Vcpu) {
        let residency = vcpu.pcpu.residency();
        let Some(displaced) = residency.claim(vcpu.token()) else {
            return;
        };
        let counters = self.layout.counters().iter().map(|&msr| vcpu.pcpu.rdmsr(msr)).collect();
        residency.park(displaced, counters);
        log::debug!("VPMU: d{}v{} displaced vcpu token {}", vcpu.domain_id, vcpu.id, displaced);
    }

    /// Drop `CONTEXT_LOADED` when another vCPU has loaded over this context,
    /// restoring the counters it parked into the shadow.
    fn reconcile_residency(&self, vcpu: &mut Vcpu) {
        if !vcpu.vpmu.is_set(VpmuFlags::CONTEXT_LOADED) {
            return;
        }
        let residency = vcpu.pcpu.residency();
        if residency.resident() == Some(vcpu.token()) {
            return;
        }
        let parked = residency.take_parked(vcpu.token());

        if let (Some(counters), Some(ctxt)) = (parked, vcpu.vpmu.context.as_mut()) {
            for (shadow, value) in ctxt.counters_mut().iter_mut().zip(counters) {
                *shadow = value;
            }
        }
        vcpu.vpmu.clear(VpmuFlags::CONTEXT_LOADED);
        log::debug!("VPMU: d{}v{} context displaced, reload from shadow", vcpu.domain_id, vcpu.id);
    }

    /// Another vCPU's context is in the registers.
    fn displaced(&self, vcpu: &Vcpu) -> bool {
        matches!(vcpu.pcpu.residency().resident(), Some(token) if token != vcpu.token())
    }

    fn context_update(&self, vcpu: &mut Vcpu, kind: PmuRegType, index: usize, value: u64) {
        let Some(ctxt) = vcpu.vpmu.context.as_mut() else {
            return;
        };
        match kind {
            PmuRegType::Control => ctxt.ctrls_mut()[index] = value,
            PmuRegType::Counter => ctxt.counters_mut()[index] = value,
        }
    }

    /// Make sure hardware holds the guest's registers.
    fn ensure_loaded(&self, vcpu: &mut Vcpu) {
        self.reconcile_residency(vcpu);
        let vpmu = &vcpu.vpmu;
        if !vpmu.is_set(VpmuFlags::CONTEXT_LOADED) || vpmu.is_set(VpmuFlags::FROZEN) {
            self.context_load(vcpu);
            vcpu.vpmu.set(VpmuFlags::CONTEXT_LOADED);
            vcpu.vpmu.clear(VpmuFlags::FROZEN);
        }
    }
}

impl ArchVpmuOps for AmdVpmu {
    fn do_wrmsr(&self, vcpu: &mut Vcpu, msr: u32, mut value: u64) -> bool {
        debug_assert!(vcpu.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED));

        let Some((kind, index)) = self.layout.index_of(msr) else {
            log::debug!("VPMU: wrmsr {:#x} outside the PMU bank", msr);
            return false;
        };
        let is_ctrl = kind == PmuRegType::Control;
        let hvm = vcpu.is_hvm();
        log::trace!("VPMU: d{}v{} wrmsr {:#x} <- {:#x}", vcpu.domain_id, vcpu.id, msr, value);

        if hvm && is_ctrl && !evntsel::is_guest_mode(value) {
            value |= evntsel::GUEST_ONLY;
        }

        if is_ctrl && evntsel::is_enabled(value) && !vcpu.vpmu.is_set(VpmuFlags::RUNNING) {
            if !self.ownership.acquire(PmuOwner::Hvm) {
                return true;
            }
            vcpu.vpmu.set(VpmuFlags::RUNNING);

            if hvm && !vcpu.vpmu.fast_path {
                enable_fast_path(vcpu, &self.layout);
            }
        }

        if is_ctrl && !evntsel::is_enabled(value) && vcpu.vpmu.is_set(VpmuFlags::RUNNING) {
            vcpu.vpmu.clear(VpmuFlags::RUNNING);
            if hvm && vcpu.vpmu.fast_path {
                disable_fast_path(vcpu, &self.layout);
            }
            self.ownership.release(PmuOwner::Hvm);
        }

        self.ensure_loaded(vcpu);

        self.context_update(vcpu, kind, index, value);
        vcpu.pcpu.wrmsr(self.layout.canonical(msr), value);
        true
    }

    fn do_rdmsr(&self, vcpu: &mut Vcpu, msr: u32) -> Option<u64> {
        debug_assert!(vcpu.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED));

        if self.layout.index_of(msr).is_none() {
            log::debug!("VPMU: rdmsr {:#x} outside the PMU bank", msr);
            return None;
        }

        self.ensure_loaded(vcpu);
        let value = vcpu.pcpu.rdmsr(self.layout.canonical(msr));
        log::trace!("VPMU: d{}v{} rdmsr {:#x} -> {:#x}", vcpu.domain_id, vcpu.id, msr, value);
        Some(value)
    }

    fn do_interrupt(&self, _vcpu: &mut Vcpu) -> bool {
        true
    }

    fn destroy(&self, vcpu: &mut Vcpu) {
        if vcpu.is_hvm() && vcpu.vpmu.fast_path {
            disable_fast_path(vcpu, &self.layout);
        }

        vcpu.vpmu.context = None;
        vcpu.pcpu.residency().vacate(vcpu.token());

        if vcpu.vpmu.is_set(VpmuFlags::RUNNING) {
            self.ownership.release(PmuOwner::Hvm);
        }

        vcpu.vpmu.clear_all();
        log::debug!("VPMU: d{}v{} destroyed", vcpu.domain_id, vcpu.id);
    }

    fn save(&self, vcpu: &mut Vcpu) -> SaveOutcome {
        self.reconcile_residency(vcpu);

        if !vcpu.vpmu.is_set(VpmuFlags::CONTEXT_SAVE) {
            vcpu.vpmu.set(VpmuFlags::FROZEN);
            if self.displaced(vcpu) {
                return SaveOutcome::Stopped;
            }
            for &ctrl in self.layout.ctrls() {
                vcpu.pcpu.wrmsr(ctrl, 0);
            }
            return SaveOutcome::Stopped;
        }

        if !vcpu.vpmu.is_set(VpmuFlags::CONTEXT_LOADED) {
            return SaveOutcome::Saved;
        }

        self.context_save(vcpu);

        if !vcpu.vpmu.is_set(VpmuFlags::RUNNING) && vcpu.is_hvm() && vcpu.vpmu.fast_path {
            disable_fast_path(vcpu, &self.layout);
        }

        SaveOutcome::Saved
    }

    fn load(&self, vcpu: &mut Vcpu) {
        self.reconcile_residency(vcpu);
        vcpu.vpmu.clear(VpmuFlags::FROZEN);

        if vcpu.vpmu.is_set(VpmuFlags::CONTEXT_LOADED) {
            if let Some(ctxt) = vcpu.vpmu.context.as_ref() {
                for (&msr, &value) in self.layout.ctrls().iter().zip(ctxt.ctrls()) {
                    vcpu.pcpu.wrmsr(msr, value);
                }
            }
            return;
        }

        vcpu.vpmu.set(VpmuFlags::CONTEXT_LOADED);
        self.context_load(vcpu);
    }

    fn dump(&self, vcpu: &Vcpu) -> VpmuDump {
        let flags = vcpu.vpmu.flags();
        let mut dump = VpmuDump::flags_only(vcpu);

        let ctxt = match vcpu.vpmu.context.as_ref() {
            Some(ctxt) if flags.contains(VpmuFlags::CONTEXT_ALLOCATED) => ctxt,
            _ => return dump,
        };

        dump.allocated = true;
        dump.flag_names = flags.names();
        dump.registers = (0..self.layout.bank_size())
            .map(|i| {
                let ctrl_msr = self.layout.ctrls()[i];
                let counter_msr = self.layout.counters()[i];
                RegisterDump {
                    ctrl_msr,
                    ctrl_shadow: ctxt.ctrls()[i],
                    ctrl_hw: vcpu.pcpu.rdmsr(ctrl_msr),
                    counter_msr,
                    counter_shadow: ctxt.counters()[i],
                    counter_hw: vcpu.pcpu.rdmsr(counter_msr),
                }
            })
            .collect();
        dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VpmuConfig, VpmuMode};
    use crate::hw::{EmulatedPmuMsrs, MsrAccess, MsrWrite};
    use crate::msr::*;
    use crate::msrpm::MsrIntercept;
    use crate::vcpu::GuestKind;

    struct Harness {
        hw: Arc<EmulatedPmuMsrs>,
        ownership: Arc<PmuOwnership>,
        backend: AmdVpmu,
        vcpu: Vcpu,
    }

    fn harness(family: u16, kind: GuestKind) -> Harness {
        let ownership = Arc::new(PmuOwnership::new());
        let host = VpmuHost::with_ownership(&VpmuConfig::with_mode(VpmuMode::SelfOnly), family, ownership.clone());
        let hw = Arc::new(EmulatedPmuMsrs::for_family(family));
        let mut vcpu = Vcpu::new(7, 2, kind, hw.clone());

        assert_eq!(AmdVpmu::initialise(&mut vcpu, &host).unwrap(), InitOutcome::Enabled);
        hw.take_writes();

        Harness {
            hw,
            ownership: ownership.clone(),
            backend: AmdVpmu::new(host.layout().clone(), ownership),
            vcpu,
        }
    }

    const EVENT: u64 = evntsel::USR | evntsel::OS | 0x76;

    // ========================================================================
    // Initialization
    // ========================================================================

    #[test]
    fn test_initialise_sets_up_context() {
        let h = harness(0x15, GuestKind::Hvm);
        let vpmu = h.vcpu.vpmu();
        assert_eq!(vpmu.flags(), VpmuFlags::CONTEXT_ALLOCATED);
        assert!(!vpmu.fast_path_active());

        let ctxt = vpmu.context().unwrap();
        assert_eq!(ctxt.bank_size(), 6);
        assert_eq!(ctxt.offsets().counters, 8);
        assert_eq!(ctxt.offsets().ctrls, 8 + 6 * 8);
        assert!(h.hw.writes().is_empty());
    }

    #[test]
    fn test_initialise_disabled() {
        let ownership = Arc::new(PmuOwnership::new());
        let hw: Arc<dyn MsrAccess> = Arc::new(EmulatedPmuMsrs::default());

        let off = VpmuHost::with_ownership(&VpmuConfig::default(), 0x15, ownership.clone());
        let mut vcpu = Vcpu::new(0, 0, GuestKind::Hvm, hw.clone());
        assert_eq!(AmdVpmu::initialise(&mut vcpu, &off).unwrap(), InitOutcome::Disabled);
        assert!(!vcpu.vpmu().has_ops());
        assert!(vcpu.vpmu().context().is_none());

        let unsupported = VpmuHost::with_ownership(&VpmuConfig::with_mode(VpmuMode::All), 0x17, ownership);
        assert_eq!(AmdVpmu::initialise(&mut vcpu, &unsupported).unwrap(), InitOutcome::Disabled);
        assert!(vcpu.vpmu().flags().is_empty());
    }

    #[test]
    fn test_initialise_out_of_memory() {
        let ownership = Arc::new(PmuOwnership::new());
        let host = VpmuHost::with_ownership(&VpmuConfig::with_mode(VpmuMode::SelfOnly), 0x15, ownership.clone());
        let hw = Arc::new(EmulatedPmuMsrs::for_family(0x15));
        let mut vcpu = Vcpu::new(4, 3, GuestKind::Hvm, hw.clone());

        let mut requested = None;
        let result = AmdVpmu::initialise_with(&mut vcpu, &host, |bank| {
            requested = Some(bank);
            None
        });

        assert_eq!(requested, Some(6));
        assert!(matches!(
            result,
            Err(VpmuError::InsufficientMemory { domain_id: 4, vcpu_id: 3 })
        ));
        assert!(!vcpu.vpmu().has_ops());
        assert!(vcpu.vpmu().context().is_none());
        assert!(vcpu.vpmu().flags().is_empty());
        assert!(hw.writes().is_empty());

        // The degraded vCPU ignores PMU accesses and keeps everything trapped
        assert!(!vcpu.vpmu_do_wrmsr(MSR_AMD_FAM15H_EVNTSEL0, EVENT | evntsel::EN));
        assert_eq!(ownership.owner(), PmuOwner::None);
        assert!(vcpu.msrpm().as_bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_oversized_bank_fails_allocation() {
        let ownership = Arc::new(PmuOwnership::new());
        let host = VpmuHost::with_ownership(&VpmuConfig::with_mode(VpmuMode::SelfOnly), 0x10, ownership);
        let mut vcpu = Vcpu::new(0, 0, GuestKind::Hvm, Arc::new(EmulatedPmuMsrs::default()));

        let result = AmdVpmu::initialise_with(&mut vcpu, &host, |_| AmdPmuContext::try_new(usize::MAX));

        assert!(matches!(result, Err(VpmuError::InsufficientMemory { .. })));
        assert!(!vcpu.vpmu().has_ops());
    }

    // ========================================================================
    // Register writes
    // ========================================================================

    #[test]
    fn test_ctrl_write_forces_guest_only() {
        let mut h = harness(0x10, GuestKind::Hvm);
        let value = EVENT | evntsel::EN;

        assert!(h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL0, value));

        let expected = value | evntsel::GUEST_ONLY;
        assert_eq!(h.backend.do_rdmsr(&mut h.vcpu, MSR_K7_EVNTSEL0), Some(expected));
        assert_eq!(h.vcpu.vpmu().context().unwrap().ctrls()[0], expected);
    }

    #[test]
    fn test_counter_write_keeps_value() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_PERFCTR3, 0xFFFF_0000);

        assert_eq!(h.hw.rdmsr(MSR_K7_PERFCTR3), 0xFFFF_0000);
        assert_eq!(h.vcpu.vpmu().context().unwrap().counters()[3], 0xFFFF_0000);
        assert!(!h.vcpu.vpmu().is_set(VpmuFlags::RUNNING));
        assert!(h.vcpu.vpmu().is_set(VpmuFlags::CONTEXT_LOADED));
    }

    #[test]
    fn test_first_enable_acquires_ownership() {
        let mut h = harness(0x15, GuestKind::Hvm);

        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL1, EVENT | evntsel::EN);

        assert!(h.vcpu.vpmu().is_set(VpmuFlags::RUNNING));
        assert_eq!(h.ownership.owner(), PmuOwner::Hvm);
        assert_eq!(h.ownership.holders(), 1);
        assert!(h.vcpu.vpmu().fast_path_active());
        assert_eq!(h.vcpu.msrpm().intercept(MSR_AMD_FAM15H_PERFCTR1), MsrIntercept::NONE);
        assert_eq!(h.vcpu.msrpm().intercept(MSR_AMD_FAM15H_EVNTSEL1), MsrIntercept::WRITE);

        // A second counter does not take the token again
        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL4, EVENT | evntsel::EN);
        assert_eq!(h.ownership.holders(), 1);
    }

    #[test]
    fn test_enable_denied_drops_write() {
        let mut h = harness(0x15, GuestKind::Hvm);
        assert!(h.ownership.acquire(PmuOwner::Profiler));

        assert!(h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL0, EVENT | evntsel::EN));

        assert!(h.hw.writes().is_empty());
        assert_eq!(h.vpmu_flags(), VpmuFlags::CONTEXT_ALLOCATED);
        assert_eq!(h.vcpu.vpmu().context().unwrap().ctrls()[0], 0);
        assert!(!h.vcpu.vpmu().fast_path_active());
        assert_eq!(h.ownership.owner(), PmuOwner::Profiler);
    }

    #[test]
    fn test_disable_releases_ownership() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL2, EVENT | evntsel::EN);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL2, EVENT);

        assert!(!h.vcpu.vpmu().is_set(VpmuFlags::RUNNING));
        assert_eq!(h.ownership.owner(), PmuOwner::None);
        assert!(!h.vcpu.vpmu().fast_path_active());
        assert_eq!(h.vcpu.msrpm().intercept(MSR_K7_PERFCTR2), MsrIntercept::RW);

        // Still written through, with the guest-only bit
        assert_eq!(h.hw.rdmsr(MSR_K7_EVNTSEL2), EVENT | evntsel::GUEST_ONLY);
    }

    #[test]
    fn test_any_disable_releases_ownership() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL0, EVENT | evntsel::EN);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL1, EVENT | evntsel::EN);

        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL1, 0);

        assert!(!h.vcpu.vpmu().is_set(VpmuFlags::RUNNING));
        assert_eq!(h.ownership.holders(), 0);
        assert!(evntsel::is_enabled(h.hw.rdmsr(MSR_K7_EVNTSEL0)));
    }

    #[test]
    fn test_running_tracks_ownership() {
        let mut h = harness(0x15, GuestKind::Hvm);
        let ctrls = [MSR_AMD_FAM15H_EVNTSEL0, MSR_AMD_FAM15H_EVNTSEL3, MSR_K7_EVNTSEL1];
        let values = [EVENT | evntsel::EN, 0, EVENT | evntsel::EN, EVENT, 0, evntsel::EN];

        for (step, &value) in values.iter().enumerate() {
            let msr = ctrls[step % ctrls.len()];
            h.backend.do_wrmsr(&mut h.vcpu, msr, value);
            let running = h.vcpu.vpmu().is_set(VpmuFlags::RUNNING);
            assert_eq!(running, h.ownership.holders() == 1, "step {}", step);
            assert_eq!(running, h.vcpu.vpmu().fast_path_active(), "step {}", step);
        }
    }

    #[test]
    fn test_legacy_alias_redirected_on_fam15h() {
        let mut h = harness(0x15, GuestKind::Hvm);
        let value = EVENT | evntsel::EN;

        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL2, value);

        let expected = value | evntsel::GUEST_ONLY;
        let ctxt = h.vcpu.vpmu().context().unwrap();
        assert_eq!(ctxt.ctrls()[2], expected);
        assert_eq!(ctxt.ctrls().iter().filter(|&&c| c != 0).count(), 1);
        assert_eq!(
            h.hw.writes().last(),
            Some(&MsrWrite {
                msr: MSR_AMD_FAM15H_EVNTSEL2,
                value: expected
            })
        );
        assert_eq!(h.backend.do_rdmsr(&mut h.vcpu, MSR_K7_EVNTSEL2), Some(expected));
    }

    #[test]
    fn test_fam15h_addresses_outside_legacy_bank() {
        let mut h = harness(0x10, GuestKind::Hvm);
        assert!(!h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL0, evntsel::EN));
        assert_eq!(h.backend.do_rdmsr(&mut h.vcpu, MSR_AMD_FAM15H_PERFCTR0), None);
        assert_eq!(h.vpmu_flags(), VpmuFlags::CONTEXT_ALLOCATED);
    }

    #[test]
    fn test_pv_guest() {
        let mut h = harness(0x15, GuestKind::Pv);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL0, EVENT | evntsel::EN);

        assert_eq!(h.hw.rdmsr(MSR_AMD_FAM15H_EVNTSEL0), EVENT | evntsel::EN);
        assert!(h.vcpu.vpmu().is_set(VpmuFlags::RUNNING));
        assert_eq!(h.ownership.owner(), PmuOwner::Hvm);
        assert!(!h.vcpu.vpmu().fast_path_active());
        assert_eq!(h.vcpu.msrpm().intercept(MSR_AMD_FAM15H_PERFCTR0), MsrIntercept::RW);
    }

    #[test]
    fn test_interrupt_consumed() {
        let mut h = harness(0x10, GuestKind::Hvm);
        assert!(h.backend.do_interrupt(&mut h.vcpu));
    }

    // ========================================================================
    // Load / save
    // ========================================================================

    #[test]
    fn test_save_unloaded_freezes() {
        let mut h = harness(0x15, GuestKind::Hvm);
        h.vcpu.vpmu.context.as_mut().unwrap().ctrls_mut()[1] = 0x1234;

        assert_eq!(h.backend.save(&mut h.vcpu), SaveOutcome::Stopped);

        assert!(h.vcpu.vpmu().is_set(VpmuFlags::FROZEN));
        let writes = h.hw.take_writes();
        assert_eq!(writes.len(), 6);
        assert!(writes.iter().all(|w| w.value == 0 && get_pmu_reg_type(w.msr) == Some(PmuRegType::Control)));
        assert_eq!(h.vcpu.vpmu().context().unwrap().ctrls()[1], 0x1234);
    }

    #[test]
    fn test_freeze_keeps_running() {
        let mut h = harness(0x10, GuestKind::Hvm);
        let value = EVENT | evntsel::EN;
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL0, value);

        assert_eq!(h.backend.save(&mut h.vcpu), SaveOutcome::Stopped);

        assert!(h.vcpu.vpmu().are_all_set(VpmuFlags::RUNNING | VpmuFlags::FROZEN));
        assert_eq!(h.hw.rdmsr(MSR_K7_EVNTSEL0), 0);
        assert_eq!(h.ownership.holders(), 1);
        assert!(h.vcpu.vpmu().fast_path_active());

        // A read while frozen reloads the shadow first
        let expected = value | evntsel::GUEST_ONLY;
        assert_eq!(h.backend.do_rdmsr(&mut h.vcpu, MSR_K7_EVNTSEL0), Some(expected));
        assert!(!h.vcpu.vpmu().is_set(VpmuFlags::FROZEN));
    }

    #[test]
    fn test_double_load_rewrites_controls_only() {
        let mut h = harness(0x15, GuestKind::Hvm);

        h.backend.load(&mut h.vcpu);
        assert!(h.vcpu.vpmu().is_set(VpmuFlags::CONTEXT_LOADED));
        assert_eq!(h.hw.take_writes().len(), 12);

        h.backend.load(&mut h.vcpu);
        let writes = h.hw.take_writes();
        assert_eq!(writes.len(), 6);
        assert!(writes.iter().all(|w| get_pmu_reg_type(w.msr) == Some(PmuRegType::Control)));
    }

    #[test]
    fn test_load_after_freeze_restores_controls() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL3, EVENT | evntsel::EN);
        h.backend.save(&mut h.vcpu);
        h.hw.take_writes();

        h.backend.load(&mut h.vcpu);

        assert!(!h.vcpu.vpmu().is_set(VpmuFlags::FROZEN));
        assert_eq!(h.hw.take_writes().len(), 4);
        assert!(evntsel::is_enabled(h.hw.rdmsr(MSR_K7_EVNTSEL3)));
    }

    #[test]
    fn test_forced_save_copies_counters() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_EVNTSEL0, EVENT | evntsel::EN);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_K7_PERFCTR0, 1000);
        h.hw.advance(MSR_K7_PERFCTR0, 500);
        h.hw.wrmsr(MSR_K7_EVNTSEL0, 0xDEAD);

        h.vcpu.vpmu_mut().set(VpmuFlags::CONTEXT_SAVE);
        assert_eq!(h.backend.save(&mut h.vcpu), SaveOutcome::Saved);

        let ctxt = h.vcpu.vpmu().context().unwrap();
        assert_eq!(ctxt.counters()[0], 1500);
        assert_eq!(ctxt.ctrls()[0], EVENT | evntsel::EN | evntsel::GUEST_ONLY);
        // Guest still counting: intercepts untouched
        assert!(h.vcpu.vpmu().fast_path_active());
    }

    #[test]
    fn test_forced_save_drops_idle_fast_path() {
        let mut h = harness(0x15, GuestKind::Hvm);
        h.backend.load(&mut h.vcpu);
        let layout = h.backend.layout.clone();
        enable_fast_path(&mut h.vcpu, &layout);

        h.vcpu.vpmu_mut().set(VpmuFlags::CONTEXT_SAVE);
        assert_eq!(h.backend.save(&mut h.vcpu), SaveOutcome::Saved);

        assert!(!h.vcpu.vpmu().fast_path_active());
        assert_eq!(h.vcpu.msrpm().intercept(MSR_AMD_FAM15H_PERFCTR5), MsrIntercept::RW);
    }

    #[test]
    fn test_forced_save_unloaded_is_noop() {
        let mut h = harness(0x15, GuestKind::Hvm);
        h.vcpu.vpmu_mut().set(VpmuFlags::CONTEXT_SAVE);
        h.hw.advance(MSR_AMD_FAM15H_PERFCTR0, 9);

        assert_eq!(h.backend.save(&mut h.vcpu), SaveOutcome::Saved);

        assert!(h.hw.writes().is_empty());
        assert_eq!(h.vcpu.vpmu().context().unwrap().counters()[0], 0);
    }

    // ========================================================================
    // Destroy / dump
    // ========================================================================

    #[test]
    fn test_destroy_while_running() {
        let mut h = harness(0x15, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL5, EVENT | evntsel::EN);

        h.backend.destroy(&mut h.vcpu);

        assert!(h.vcpu.vpmu().flags().is_empty());
        assert!(h.vcpu.vpmu().context().is_none());
        assert!(!h.vcpu.vpmu().fast_path_active());
        assert!(h.vcpu.msrpm().as_bytes().iter().all(|&b| b == 0xFF));
        assert_eq!(h.ownership.owner(), PmuOwner::None);
    }

    #[test]
    fn test_destroy_idle_keeps_other_holders() {
        let mut h = harness(0x10, GuestKind::Hvm);
        assert!(h.ownership.acquire(PmuOwner::Hvm));

        h.backend.destroy(&mut h.vcpu);

        assert_eq!(h.ownership.holders(), 1);
        assert!(h.vcpu.vpmu().flags().is_empty());
    }

    #[test]
    fn test_dump_does_not_mutate() {
        let mut h = harness(0x15, GuestKind::Hvm);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_EVNTSEL0, EVENT | evntsel::EN);
        h.backend.do_wrmsr(&mut h.vcpu, MSR_AMD_FAM15H_PERFCTR0, 5);
        h.hw.advance(MSR_AMD_FAM15H_PERFCTR0, 10);
        h.hw.take_writes();
        let flags = h.vpmu_flags();

        let dump = h.backend.dump(&h.vcpu);

        assert_eq!(h.vpmu_flags(), flags);
        assert!(h.hw.writes().is_empty());
        assert!(dump.allocated);
        assert_eq!(dump.flag_names, vec!["RUNNING", "LOADED", "ALLOCATED"]);
        assert_eq!(dump.registers.len(), 6);
        assert_eq!(dump.registers[0].counter_shadow, 5);
        assert_eq!(dump.registers[0].counter_hw, 15);
        assert_eq!(dump.diverged_registers().count(), 1);
    }

    #[test]
    fn test_dump_after_destroy() {
        let mut h = harness(0x10, GuestKind::Hvm);
        h.backend.destroy(&mut h.vcpu);

        let dump = h.backend.dump(&h.vcpu);
        assert!(!dump.allocated);
        assert!(dump.registers.is_empty());
        assert_eq!(dump.to_string(), "    VPMU state: 0x0 \n");
    }

    impl Harness {
        fn vpmu_flags(&self) -> VpmuFlags {
            self.vcpu.vpmu().flags()
        }
    }
}
