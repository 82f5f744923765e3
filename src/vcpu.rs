//! vCPU PMU state and generic vPMU hooks
//!
//! Each [`Vcpu`] owns its [`Vpmu`] exclusively; the hooks below are called
//! by the trap handler and the scheduler of that vCPU only, so nothing here
//! is locked.
//!
//! ```text
//!   trap handler ──► vpmu_do_wrmsr / vpmu_do_rdmsr ─┐
//!   scheduler ─────► vpmu_load / vpmu_save ─────────┼──► ArchVpmuOps (AMD)
//!   teardown ──────► vpmu_destroy ──────────────────┘         │
//!                                                             ▼
//!                                         shadow context, MSRPM, physical MSRs
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::amd::AmdVpmu;
use crate::context::AmdPmuContext;
use crate::dump::VpmuDump;
use crate::error::VpmuResult;
use crate::flags::VpmuFlags;
use crate::host::VpmuHost;
use crate::hw::MsrAccess;
use crate::msrpm::MsrPermissionMap;
use crate::ops::{ArchVpmuOps, InitOutcome, SaveOutcome};

/// Kind of guest a vCPU belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    /// Hardware-assisted guest running under SVM
    Hvm,
    /// Paravirtualized guest
    Pv,
}

/// vPMU state of one vCPU
#[derive(Default)]
pub struct Vpmu {
    flags: VpmuFlags,
    pub(crate) context: Option<AmdPmuContext>,
    /// Counters pass through, controls trap on write only
    pub(crate) fast_path: bool,
    ops: Option<Arc<dyn ArchVpmuOps>>,
}

impl Vpmu {
    pub fn is_set(&self, flag: VpmuFlags) -> bool {
        self.flags.intersects(flag)
    }

    pub fn are_all_set(&self, flags: VpmuFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn set(&mut self, flag: VpmuFlags) {
        self.flags.insert(flag);
    }

    pub fn clear(&mut self, flag: VpmuFlags) {
        self.flags.remove(flag);
    }

    pub fn clear_all(&mut self) {
        self.flags = VpmuFlags::empty();
    }

    pub fn flags(&self) -> VpmuFlags {
        self.flags
    }

    pub fn context(&self) -> Option<&AmdPmuContext> {
        self.context.as_ref()
    }

    /// Fast-path intercepts installed?
    pub fn fast_path_active(&self) -> bool {
        self.fast_path
    }

    pub fn has_ops(&self) -> bool {
        self.ops.is_some()
    }

    pub(crate) fn install_ops(&mut self, ops: Arc<dyn ArchVpmuOps>) {
        self.ops = Some(ops);
    }
}

impl std::fmt::Debug for Vpmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vpmu")
            .field("flags", &self.flags)
            .field("context", &self.context)
            .field("fast_path", &self.fast_path)
            .field("has_ops", &self.ops.is_some())
            .finish()
    }
}

static NEXT_VCPU_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A virtual CPU, as far as the vPMU is concerned
pub struct Vcpu {
    pub id: u32,
    pub domain_id: u32,
    /// Host-unique identity, used for physical CPU residency
    token: u64,
    kind: GuestKind,
    /// Physical CPU this vCPU is scheduled on
    pub(crate) pcpu: Arc<dyn MsrAccess>,
    pub(crate) msrpm: MsrPermissionMap,
    pub(crate) vpmu: Vpmu,
}

impl Vcpu {
    pub fn new(domain_id: u32, id: u32, kind: GuestKind, pcpu: Arc<dyn MsrAccess>) -> Self {
        Self {
            id,
            domain_id,
            token: NEXT_VCPU_TOKEN.fetch_add(1, Ordering::Relaxed),
            kind,
            pcpu,
            msrpm: MsrPermissionMap::new(),
            vpmu: Vpmu::default(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn kind(&self) -> GuestKind {
        self.kind
    }

    pub fn is_hvm(&self) -> bool {
        self.kind == GuestKind::Hvm
    }

    pub fn vpmu(&self) -> &Vpmu {
        &self.vpmu
    }

    pub fn vpmu_mut(&mut self) -> &mut Vpmu {
        &mut self.vpmu
    }

    pub fn msrpm(&self) -> &MsrPermissionMap {
        &self.msrpm
    }

    pub fn pcpu(&self) -> &Arc<dyn MsrAccess> {
        &self.pcpu
    }

    /// Move to another physical CPU. The caller saves the vPMU first.
    pub fn migrate(&mut self, pcpu: Arc<dyn MsrAccess>) {
        debug_assert!(
            !self.vpmu.is_set(VpmuFlags::CONTEXT_LOADED),
            "vcpu migrated with vPMU context still loaded"
        );
        self.pcpu = pcpu;
    }

    fn ops(&self) -> Option<Arc<dyn ArchVpmuOps>> {
        self.vpmu.ops.clone()
    }

    /// The context is out of hardware; the physical CPU no longer holds it.
    fn unload(&mut self) {
        self.vpmu.clear(VpmuFlags::CONTEXT_LOADED);
        self.pcpu.residency().vacate(self.token);
    }

    // ========================================================================
    // Generic vPMU hooks
    // ========================================================================

    /// Allocate the vPMU context and install the AMD backend. An existing
    /// context is destroyed first so its ownership hold and intercepts are
    /// returned.
    pub fn vpmu_initialise(&mut self, host: &VpmuHost) -> VpmuResult<InitOutcome> {
        if self.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED) {
            self.vpmu_destroy();
        }
        AmdVpmu::initialise(self, host)
    }

    pub fn vpmu_do_wrmsr(&mut self, msr: u32, value: u64) -> bool {
        match self.ops() {
            Some(ops) => ops.do_wrmsr(self, msr, value),
            None => false,
        }
    }

    pub fn vpmu_do_rdmsr(&mut self, msr: u32) -> Option<u64> {
        self.ops()?.do_rdmsr(self, msr)
    }

    pub fn vpmu_do_interrupt(&mut self) -> bool {
        match self.ops() {
            Some(ops) => ops.do_interrupt(self),
            None => false,
        }
    }

    /// Guest resume. Nothing to do unless the guest is counting or its
    /// context is still in hardware.
    pub fn vpmu_load(&mut self) {
        if !self.vpmu.is_set(VpmuFlags::CONTEXT_ALLOCATED) {
            return;
        }
        if !self.vpmu.is_set(VpmuFlags::RUNNING) && !self.vpmu.is_set(VpmuFlags::CONTEXT_LOADED) {
            return;
        }
        if let Some(ops) = self.ops() {
            ops.load(self);
        }
    }

    /// Guest suspend
    pub fn vpmu_save(&mut self) -> Option<SaveOutcome> {
        if !self.vpmu.are_all_set(VpmuFlags::CONTEXT_ALLOCATED | VpmuFlags::CONTEXT_LOADED) {
            return None;
        }
        let outcome = self.ops()?.save(self);
        if outcome == SaveOutcome::Saved {
            self.unload();
        }
        Some(outcome)
    }

    /// Full save, used before the vCPU leaves its physical CPU.
    pub fn vpmu_save_force(&mut self) -> Option<SaveOutcome> {
        if !self.vpmu.is_set(VpmuFlags::CONTEXT_LOADED) {
            return None;
        }
        let ops = self.ops()?;

        self.vpmu.set(VpmuFlags::CONTEXT_SAVE);
        let outcome = ops.save(self);
        self.vpmu.clear(VpmuFlags::CONTEXT_SAVE);
        self.unload();
        Some(outcome)
    }

    /// Tear down the vPMU; the backend is uninstalled afterwards.
    pub fn vpmu_destroy(&mut self) {
        if let Some(ops) = self.vpmu.ops.take() {
            ops.destroy(self);
        }
    }

    /// Operator dump, also written to the host log. Flags only when no
    /// backend is installed.
    pub fn vpmu_dump(&self) -> VpmuDump {
        let dump = match self.ops() {
            Some(ops) => ops.dump(self),
            None => VpmuDump::flags_only(self),
        };
        dump.log();
        dump
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("domain_id", &self.domain_id)
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("vpmu", &self.vpmu)
            .finish()
    }
}

/// Dump every vCPU of a domain
pub fn vpmu_dump_domain(vcpus: &[Vcpu]) -> Vec<VpmuDump> {
    vcpus.iter().map(Vcpu::vpmu_dump).collect()
}
