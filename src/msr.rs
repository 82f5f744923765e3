//! AMD PMU Model-Specific Registers
//!
//! Family 10h-style parts expose four counters through the legacy K7
//! register block. Family 15h parts add an extended block of six
//! interleaved control/counter pairs and keep the K7 addresses as aliases
//! of the first four extended pairs.
//!
//! ```text
//!   Legacy (K7)                        Extended (Fam15h)
//!   0xC0010000..03  PERF_CTL0..3       0xC0010200  PERF_CTL0
//!   0xC0010004..07  PERF_CTR0..3       0xC0010201  PERF_CTR0
//!                                      ...
//!                                      0xC001020A  PERF_CTL5
//!                                      0xC001020B  PERF_CTR5
//! ```

/// Legacy K7 control registers (event select)
pub const MSR_K7_EVNTSEL0: u32 = 0xC001_0000;
pub const MSR_K7_EVNTSEL1: u32 = 0xC001_0001;
pub const MSR_K7_EVNTSEL2: u32 = 0xC001_0002;
pub const MSR_K7_EVNTSEL3: u32 = 0xC001_0003;

/// Legacy K7 counter registers
pub const MSR_K7_PERFCTR0: u32 = 0xC001_0004;
pub const MSR_K7_PERFCTR1: u32 = 0xC001_0005;
pub const MSR_K7_PERFCTR2: u32 = 0xC001_0006;
pub const MSR_K7_PERFCTR3: u32 = 0xC001_0007;

/// Family 15h extended block (control at even, counter at odd addresses)
pub const MSR_AMD_FAM15H_EVNTSEL0: u32 = 0xC001_0200;
pub const MSR_AMD_FAM15H_PERFCTR0: u32 = 0xC001_0201;
pub const MSR_AMD_FAM15H_EVNTSEL1: u32 = 0xC001_0202;
pub const MSR_AMD_FAM15H_PERFCTR1: u32 = 0xC001_0203;
pub const MSR_AMD_FAM15H_EVNTSEL2: u32 = 0xC001_0204;
pub const MSR_AMD_FAM15H_PERFCTR2: u32 = 0xC001_0205;
pub const MSR_AMD_FAM15H_EVNTSEL3: u32 = 0xC001_0206;
pub const MSR_AMD_FAM15H_PERFCTR3: u32 = 0xC001_0207;
pub const MSR_AMD_FAM15H_EVNTSEL4: u32 = 0xC001_0208;
pub const MSR_AMD_FAM15H_PERFCTR4: u32 = 0xC001_0209;
pub const MSR_AMD_FAM15H_EVNTSEL5: u32 = 0xC001_020A;
pub const MSR_AMD_FAM15H_PERFCTR5: u32 = 0xC001_020B;

/// Event select (PERF_CTL) bits
pub mod evntsel {
    pub const USR: u64 = 1 << 16;        // Count in user mode
    pub const OS: u64 = 1 << 17;         // Count in kernel mode
    pub const EN: u64 = 1 << 22;         // Counter enable
    pub const GUEST_ONLY: u64 = 1 << 40; // Count only while in guest mode

    /// Enable bit set?
    pub fn is_enabled(value: u64) -> bool {
        value & EN != 0
    }

    /// Guest-only bit set?
    pub fn is_guest_mode(value: u64) -> bool {
        value & GUEST_ONLY != 0
    }
}

/// Kind of PMU register behind an MSR address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuRegType {
    /// PERF_CTR: raw counter value
    Counter,
    /// PERF_CTL: event select / enable
    Control,
}

/// Classify an MSR address, `None` for anything outside the PMU blocks.
pub fn get_pmu_reg_type(addr: u32) -> Option<PmuRegType> {
    match addr {
        MSR_K7_EVNTSEL0..=MSR_K7_EVNTSEL3 => Some(PmuRegType::Control),
        MSR_K7_PERFCTR0..=MSR_K7_PERFCTR3 => Some(PmuRegType::Counter),
        MSR_AMD_FAM15H_EVNTSEL0..=MSR_AMD_FAM15H_PERFCTR5 => {
            if addr & 1 != 0 {
                Some(PmuRegType::Counter)
            } else {
                Some(PmuRegType::Control)
            }
        }
        _ => None,
    }
}

/// Is this one of the legacy K7 addresses?
pub fn is_legacy_alias(addr: u32) -> bool {
    (MSR_K7_EVNTSEL0..=MSR_K7_PERFCTR3).contains(&addr)
}

/// Map a legacy K7 address onto the family 15h register it mirrors.
/// Every other address is returned unchanged.
pub fn fam15h_addr(addr: u32) -> u32 {
    match addr {
        MSR_K7_PERFCTR0 => MSR_AMD_FAM15H_PERFCTR0,
        MSR_K7_PERFCTR1 => MSR_AMD_FAM15H_PERFCTR1,
        MSR_K7_PERFCTR2 => MSR_AMD_FAM15H_PERFCTR2,
        MSR_K7_PERFCTR3 => MSR_AMD_FAM15H_PERFCTR3,
        MSR_K7_EVNTSEL0 => MSR_AMD_FAM15H_EVNTSEL0,
        MSR_K7_EVNTSEL1 => MSR_AMD_FAM15H_EVNTSEL1,
        MSR_K7_EVNTSEL2 => MSR_AMD_FAM15H_EVNTSEL2,
        MSR_K7_EVNTSEL3 => MSR_AMD_FAM15H_EVNTSEL3,
        _ => addr,
    }
}
