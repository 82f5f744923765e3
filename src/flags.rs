//! vPMU state flags
//!
//! The flags are independent; combinations such as `CONTEXT_LOADED | FROZEN`
//! are normal.

bitflags::bitflags! {
    /// Per-vCPU vPMU state
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VpmuFlags: u32 {
        /// Shadow storage allocated
        const CONTEXT_ALLOCATED = 1 << 0;
        /// Shadow state is resident in hardware
        const CONTEXT_LOADED = 1 << 1;
        /// At least one counter enabled and ownership held
        const RUNNING = 1 << 2;
        /// Scheduler asked for a full save rather than a freeze
        const CONTEXT_SAVE = 1 << 3;
        /// Hardware controls zeroed, shadow still current
        const FROZEN = 1 << 4;
        /// Passive profiling domain (diagnostics only)
        const PASSIVE_DOMAIN_ALLOCATED = 1 << 5;
    }
}

impl VpmuFlags {
    /// Readable names, in dump order.
    pub fn names(self) -> Vec<&'static str> {
        const NAMES: [(VpmuFlags, &str); 6] = [
            (VpmuFlags::PASSIVE_DOMAIN_ALLOCATED, "PASSIVE_DOMAIN_ALLOCATED"),
            (VpmuFlags::FROZEN, "FROZEN"),
            (VpmuFlags::CONTEXT_SAVE, "SAVE"),
            (VpmuFlags::RUNNING, "RUNNING"),
            (VpmuFlags::CONTEXT_LOADED, "LOADED"),
            (VpmuFlags::CONTEXT_ALLOCATED, "ALLOCATED"),
        ];

        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}
