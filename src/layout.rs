//! Register Layout Table
//!
//! Selected once per host from the CPU family and shared read-only by every
//! per-guest context afterwards.

use crate::error::{VpmuError, VpmuResult};
use crate::msr::*;
use crate::shared;

/// Family 10h-style bank size
pub const F10H_NUM_COUNTERS: usize = 4;
/// Family 15h bank size
pub const F15H_NUM_COUNTERS: usize = 6;

static AMD_F10H_COUNTERS: [u32; F10H_NUM_COUNTERS] = [
    MSR_K7_PERFCTR0,
    MSR_K7_PERFCTR1,
    MSR_K7_PERFCTR2,
    MSR_K7_PERFCTR3,
];

static AMD_F10H_CTRLS: [u32; F10H_NUM_COUNTERS] = [
    MSR_K7_EVNTSEL0,
    MSR_K7_EVNTSEL1,
    MSR_K7_EVNTSEL2,
    MSR_K7_EVNTSEL3,
];

static AMD_F15H_COUNTERS: [u32; F15H_NUM_COUNTERS] = [
    MSR_AMD_FAM15H_PERFCTR0,
    MSR_AMD_FAM15H_PERFCTR1,
    MSR_AMD_FAM15H_PERFCTR2,
    MSR_AMD_FAM15H_PERFCTR3,
    MSR_AMD_FAM15H_PERFCTR4,
    MSR_AMD_FAM15H_PERFCTR5,
];

static AMD_F15H_CTRLS: [u32; F15H_NUM_COUNTERS] = [
    MSR_AMD_FAM15H_EVNTSEL0,
    MSR_AMD_FAM15H_EVNTSEL1,
    MSR_AMD_FAM15H_EVNTSEL2,
    MSR_AMD_FAM15H_EVNTSEL3,
    MSR_AMD_FAM15H_EVNTSEL4,
    MSR_AMD_FAM15H_EVNTSEL5,
];

/// Decode the display family from CPUID leaf 1 EAX.
///
/// Base 0xF plus an 8-bit extended family reaches 0x10E, so the result is
/// wider than a byte.
pub fn cpu_family(cpuid_1_eax: u32) -> u16 {
    let base = ((cpuid_1_eax >> 8) & 0xF) as u16;
    if base == 0xF {
        base + ((cpuid_1_eax >> 20) & 0xFF) as u16
    } else {
        base
    }
}

/// Counter/control register addresses for the host CPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutTable {
    counters: &'static [u32],
    ctrls: &'static [u32],
    /// Legacy K7 writes must be redirected to the extended block
    mirrored_aliases: bool,
}

impl LayoutTable {
    /// Layout with no registers; vPMU is disabled on this host.
    pub const fn empty() -> Self {
        Self {
            counters: &[],
            ctrls: &[],
            mirrored_aliases: false,
        }
    }

    /// Pick the layout for a CPU family.
    pub fn resolve(family: u16) -> VpmuResult<Self> {
        match family {
            0x15 => Ok(Self {
                counters: &AMD_F15H_COUNTERS,
                ctrls: &AMD_F15H_CTRLS,
                mirrored_aliases: true,
            }),
            0x10 | 0x12 | 0x14 | 0x16 => Ok(Self {
                counters: &AMD_F10H_COUNTERS,
                ctrls: &AMD_F10H_CTRLS,
                mirrored_aliases: false,
            }),
            _ => Err(VpmuError::UnsupportedFamily(family)),
        }
    }

    /// Check that the register arrays fit into the shared page.
    pub fn validate(&self, page_size: usize) -> VpmuResult<()> {
        if shared::fits_in_page(self.bank_size(), page_size) {
            return Ok(());
        }
        Err(VpmuError::SharedPageOverflow {
            required: shared::required_page_bytes(self.bank_size()),
            page_size,
        })
    }

    /// Resolve and validate, degrading to the empty layout on any failure.
    pub fn for_host(family: u16, page_size: usize) -> Self {
        let layout = match Self::resolve(family) {
            Ok(layout) => layout,
            Err(e) => {
                log::warn!("VPMU: {}", e);
                return Self::empty();
            }
        };

        if let Err(e) = layout.validate(page_size) {
            log::warn!("VPMU: {}", e);
            return Self::empty();
        }

        log::info!(
            "VPMU: family {:#x}, {} counters{}",
            family,
            layout.bank_size(),
            if layout.mirrored_aliases { ", legacy aliases mirrored" } else { "" }
        );
        layout
    }

    pub fn bank_size(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn counters(&self) -> &'static [u32] {
        self.counters
    }

    pub fn ctrls(&self) -> &'static [u32] {
        self.ctrls
    }

    pub fn mirrored_aliases(&self) -> bool {
        self.mirrored_aliases
    }

    /// Address the shadow and hardware access should use for `msr`.
    pub fn canonical(&self, msr: u32) -> u32 {
        if self.mirrored_aliases && is_legacy_alias(msr) {
            fam15h_addr(msr)
        } else {
            msr
        }
    }

    /// Bank index and register kind for `msr`, after alias redirection.
    pub fn index_of(&self, msr: u32) -> Option<(PmuRegType, usize)> {
        let msr = self.canonical(msr);
        if let Some(i) = self.ctrls.iter().position(|&ctrl| ctrl == msr) {
            return Some((PmuRegType::Control, i));
        }
        self.counters
            .iter()
            .position(|&counter| counter == msr)
            .map(|i| (PmuRegType::Counter, i))
    }
}

impl Default for LayoutTable {
    fn default() -> Self {
        Self::empty()
    }
}
