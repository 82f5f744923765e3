//! AMD vPMU context
//!
//! Shadow copies of the counter and control registers, stored the way they
//! are exported through the shared page: a small header with the array
//! offsets followed by one `u64` array for counters and one for controls.

use crate::shared::{self, RegisterOffsets};

/// Shadow register storage of one vCPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdPmuContext {
    offsets: RegisterOffsets,
    bank_size: usize,
    /// counters[0..n] followed by ctrls[0..n]
    regs: Vec<u64>,
}

impl AmdPmuContext {
    /// Allocate zeroed storage for `bank_size` register pairs.
    ///
    /// Returns `None` when the allocation cannot be satisfied.
    pub fn try_new(bank_size: usize) -> Option<Self> {
        let len = bank_size.checked_mul(2)?;
        let mut regs = Vec::new();
        regs.try_reserve_exact(len).ok()?;
        regs.resize(len, 0);

        Some(Self {
            offsets: RegisterOffsets::for_bank(bank_size),
            bank_size,
            regs,
        })
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    /// Array offsets exported to guest tooling
    pub fn offsets(&self) -> RegisterOffsets {
        self.offsets
    }

    pub fn counters(&self) -> &[u64] {
        &self.regs[..self.bank_size]
    }

    pub fn counters_mut(&mut self) -> &mut [u64] {
        &mut self.regs[..self.bank_size]
    }

    pub fn ctrls(&self) -> &[u64] {
        &self.regs[self.bank_size..]
    }

    pub fn ctrls_mut(&mut self) -> &mut [u64] {
        &mut self.regs[self.bank_size..]
    }

    /// Serialize into the shared page AMD context format.
    pub fn to_shared_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(shared::AMD_CTXT_HEADER_SIZE + self.regs.len() * shared::REGISTER_WIDTH);
        out.extend_from_slice(&self.offsets.counters.to_le_bytes());
        out.extend_from_slice(&self.offsets.ctrls.to_le_bytes());
        for reg in &self.regs {
            out.extend_from_slice(&reg.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_alloc() {
        let ctxt = AmdPmuContext::try_new(6).unwrap();
        assert_eq!(ctxt.counters().len(), 6);
        assert_eq!(ctxt.ctrls().len(), 6);
        assert!(ctxt.counters().iter().chain(ctxt.ctrls()).all(|&r| r == 0));
        assert_eq!(ctxt.offsets().counters, 8);
        assert_eq!(ctxt.offsets().ctrls, 56);
    }

    #[test]
    fn test_arrays_do_not_overlap() {
        let mut ctxt = AmdPmuContext::try_new(4).unwrap();
        ctxt.counters_mut()[3] = 0x33;
        ctxt.ctrls_mut()[0] = 0x44;
        assert_eq!(ctxt.counters(), &[0, 0, 0, 0x33]);
        assert_eq!(ctxt.ctrls(), &[0x44, 0, 0, 0]);
    }

    #[test]
    fn test_shared_bytes_layout() {
        let mut ctxt = AmdPmuContext::try_new(4).unwrap();
        ctxt.counters_mut()[1] = 0x1122_3344;
        ctxt.ctrls_mut()[2] = 0x0041_0000;

        let bytes = ctxt.to_shared_bytes();
        assert_eq!(bytes.len(), 8 + 8 * 8);

        let counters = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let ctrls = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;

        let read = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        assert_eq!(read(counters + 8), 0x1122_3344);
        assert_eq!(read(ctrls + 2 * 8), 0x0041_0000);
    }
}
