//! SVM MSR Permission Map (MSRPM)
//!
//! Two bits per MSR decide whether a guest RDMSR/WRMSR exits to the host.
//! The 8 KiB map covers three architectural MSR ranges; accesses to MSRs
//! outside them always exit.
//!
//! ```text
//! byte offset   MSR range
//! 0x0000        0x0000_0000 - 0x0000_1FFF
//! 0x0800        0xC000_0000 - 0xC000_1FFF
//! 0x1000        0xC001_0000 - 0xC001_1FFF
//! 0x1800        reserved
//! ```

/// MSRPM size in bytes
pub const MSRPM_SIZE: usize = 8192;

/// MSRs covered by one range
const MSRS_PER_RANGE: u32 = 0x2000;

/// Base MSR of each range, indexed by range number
const RANGE_BASES: [u32; 3] = [0x0000_0000, 0xC000_0000, 0xC001_0000];

/// Bytes per range (2 bits per MSR)
const RANGE_BYTES: usize = (MSRS_PER_RANGE as usize * 2) / 8;

bitflags::bitflags! {
    /// Which accesses to an MSR exit to the host
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MsrIntercept: u8 {
        /// RDMSR exits
        const READ = 1 << 0;
        /// WRMSR exits
        const WRITE = 1 << 1;
        /// Both exit
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MsrIntercept {
    /// Pass-through: neither access exits
    pub const NONE: Self = Self::empty();
}

/// Per-vCPU MSR permission map
pub struct MsrPermissionMap {
    bitmap: Box<[u8; MSRPM_SIZE]>,
}

impl MsrPermissionMap {
    /// Create a map intercepting every MSR access
    pub fn new() -> Self {
        Self {
            bitmap: Box::new([0xFF; MSRPM_SIZE]),
        }
    }

    /// Byte index and bit shift of `msr`, `None` outside the mapped ranges
    fn locate(msr: u32) -> Option<(usize, u32)> {
        RANGE_BASES.iter().enumerate().find_map(|(range, &base)| {
            let offset = msr.checked_sub(base)?;
            if offset >= MSRS_PER_RANGE {
                return None;
            }
            let bit = offset as usize * 2;
            Some((range * RANGE_BYTES + bit / 8, (bit % 8) as u32))
        })
    }

    /// Set which accesses to `msr` exit.
    ///
    /// MSRs outside the mapped ranges cannot be passed through; the call
    /// is ignored for them.
    pub fn set_intercept(&mut self, msr: u32, mode: MsrIntercept) {
        let Some((byte, shift)) = Self::locate(msr) else {
            log::debug!("MSRPM: MSR {:#x} is not mappable, always intercepted", msr);
            return;
        };
        let cell = &mut self.bitmap[byte];
        *cell &= !(0b11 << shift);
        *cell |= mode.bits() << shift;
    }

    /// Which accesses to `msr` currently exit
    pub fn intercept(&self, msr: u32) -> MsrIntercept {
        match Self::locate(msr) {
            Some((byte, shift)) => MsrIntercept::from_bits_truncate(self.bitmap[byte] >> shift),
            None => MsrIntercept::RW,
        }
    }

    pub fn is_read_intercepted(&self, msr: u32) -> bool {
        self.intercept(msr).contains(MsrIntercept::READ)
    }

    pub fn is_write_intercepted(&self, msr: u32) -> bool {
        self.intercept(msr).contains(MsrIntercept::WRITE)
    }

    /// Raw map, as handed to the VMCB
    pub fn as_bytes(&self) -> &[u8] {
        &self.bitmap[..]
    }
}

impl Default for MsrPermissionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MsrPermissionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let passthrough = self.bitmap.iter().filter(|&&b| b != 0xFF).count();
        f.debug_struct("MsrPermissionMap")
            .field("relaxed_bytes", &passthrough)
            .finish()
    }
}
