//! Shared vPMU page layout
//!
//! Every vCPU exports its PMU state through one fixed-size page. The page
//! starts with the generic PMU data header; the AMD context lives inside it
//! and is followed by the register arrays:
//!
//! ```text
//! ┌──────────────────────────────┐ 0x000
//! │ vcpu_id, pcpu_id, domain_id  │
//! │ sampled regs, pmu_flags, LVT │
//! │ ┌──────────────────────────┐ │
//! │ │ AMD ctxt: counters (u32) │ │  offset of counter array
//! │ │           ctrls    (u32) │ │  offset of control array
//! │ └──────────────────────────┘ │
//! ├──────────────────────────────┤ PMU_DATA_SIZE
//! │ u64 counters[bank_size]      │
//! │ u64 ctrls[bank_size]         │
//! └──────────────────────────────┘
//! ```
//!
//! Offsets are relative to the AMD context header so tooling can find the
//! arrays without knowing the bank size in advance.

/// Default shared page size
pub const PAGE_SIZE: usize = 4096;

/// Width of one exported register
pub const REGISTER_WIDTH: usize = core::mem::size_of::<u64>();

/// Generic PMU data header field offsets
pub mod pmu_data {
    pub const VCPU_ID: usize = 0x00;
    pub const PCPU_ID: usize = 0x04;
    pub const DOMAIN_ID: usize = 0x08;
    pub const REGS: usize = 0x10;
    pub const PMU_FLAGS: usize = 0x50;
    pub const LAPIC_LVTPC: usize = 0x58;
    pub const ARCH_CTXT: usize = 0x60;
}

/// Size of the architecture context union inside the header
pub const ARCH_CTXT_SIZE: usize = 128;

/// Size of the generic PMU data header, including the arch context union
pub const PMU_DATA_SIZE: usize = pmu_data::ARCH_CTXT + ARCH_CTXT_SIZE;

/// Size of the AMD context header (two u32 offsets)
pub const AMD_CTXT_HEADER_SIZE: usize = 2 * core::mem::size_of::<u32>();

/// Bytes the page must hold for a bank of `bank_size` register pairs.
pub fn required_page_bytes(bank_size: usize) -> usize {
    PMU_DATA_SIZE + 2 * REGISTER_WIDTH * bank_size
}

/// Does a bank of `bank_size` pairs fit into a page of `page_size` bytes?
pub fn fits_in_page(bank_size: usize, page_size: usize) -> bool {
    required_page_bytes(bank_size) <= page_size
}

/// Offsets of the register arrays, relative to the AMD context header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOffsets {
    pub counters: u32,
    pub ctrls: u32,
}

impl RegisterOffsets {
    /// Counters follow the header directly, controls follow the counters.
    pub fn for_bank(bank_size: usize) -> Self {
        let counters = AMD_CTXT_HEADER_SIZE as u32;
        let ctrls = counters + (REGISTER_WIDTH * bank_size) as u32;
        Self { counters, ctrls }
    }
}
