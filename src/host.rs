//! Host-wide vPMU state
//!
//! Built once at boot and shared by reference with every vCPU.

use std::sync::Arc;

use crate::config::{VpmuConfig, VpmuMode};
use crate::layout::LayoutTable;
use crate::ownership::{pmu_ownership, PmuOwnership};

/// Boot-time vPMU state of a host
#[derive(Debug, Clone)]
pub struct VpmuHost {
    mode: VpmuMode,
    layout: Arc<LayoutTable>,
    ownership: Arc<PmuOwnership>,
}

impl VpmuHost {
    /// Select the register layout for `detected_family` and bind to the
    /// process-wide PMU arbiter.
    ///
    /// Never fails: an unsupported CPU or an oversized register bank leaves
    /// the host with an empty layout and guests without a vPMU.
    pub fn boot(config: &VpmuConfig, detected_family: u16) -> Self {
        Self::with_ownership(config, detected_family, pmu_ownership().clone())
    }

    /// Like [`boot`](Self::boot), with an explicit arbiter
    pub fn with_ownership(config: &VpmuConfig, detected_family: u16, ownership: Arc<PmuOwnership>) -> Self {
        let family = config.cpu_family.unwrap_or(detected_family);
        let layout = LayoutTable::for_host(family, config.shared_page_size);

        if config.mode.is_off() {
            log::info!("VPMU: disabled by configuration");
        }

        Self {
            mode: config.mode,
            layout: Arc::new(layout),
            ownership,
        }
    }

    pub fn mode(&self) -> VpmuMode {
        self.mode
    }

    pub fn layout(&self) -> &Arc<LayoutTable> {
        &self.layout
    }

    pub fn ownership(&self) -> &Arc<PmuOwnership> {
        &self.ownership
    }

    /// Will vCPUs on this host get a vPMU?
    pub fn is_enabled(&self) -> bool {
        !self.mode.is_off() && !self.layout.is_empty()
    }
}
