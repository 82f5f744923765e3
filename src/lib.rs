//! NVM vPMU - AMD Performance Monitoring Unit virtualization
//!
//! Lets guests program the AMD PMU counter and event-select MSRs as if they
//! owned the hardware. The host shadows every register, moves the shadow in
//! and out of the physical PMU on guest resume/suspend, and arbitrates the
//! single physical PMU between guests and in-host profiling.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Generic vPMU hooks (Vcpu)                    │
//! │  vpmu_initialise  vpmu_do_wrmsr/rdmsr  vpmu_load/save  vpmu_dump     │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                         AMD backend (AmdVpmu)                        │
//! │  ┌────────────────┐ ┌────────────────┐ ┌───────────────────────────┐ │
//! │  │ Access emulator│ │ Load / save    │ │ Diagnostic dump           │ │
//! │  └───────┬────────┘ └───────┬────────┘ └───────────────────────────┘ │
//! │          │                  │                                        │
//! │  ┌───────▼────────┐ ┌───────▼────────┐ ┌───────────────────────────┐ │
//! │  │ Shadow context │ │ MSR intercepts │ │ PMU ownership (global)    │ │
//! │  └────────────────┘ └────────────────┘ └───────────────────────────┘ │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Layout table (per host, immutable)  │  Physical MSRs (MsrAccess)    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nvm_vpmu::{VpmuConfig, VpmuHost, Vcpu, GuestKind, EmulatedPmuMsrs};
//!
//! let config = VpmuConfig::load(Path::new("/etc/nvm/vpmu.yaml"))?;
//! let host = VpmuHost::boot(&config, cpu_family(cpuid_1_eax));
//!
//! let mut vcpu = Vcpu::new(domain_id, 0, GuestKind::Hvm, pcpu);
//! vcpu.vpmu_initialise(&host)?;
//!
//! // trap handler
//! vcpu.vpmu_do_wrmsr(msr, value);
//!
//! // scheduler
//! vcpu.vpmu_save();
//! vcpu.vpmu_load();
//! ```

// Register definitions and layouts
pub mod msr;
pub mod layout;
pub mod shared;

// Per-vCPU state
pub mod flags;
pub mod context;
pub mod vcpu;

// Shared host state
pub mod config;
pub mod host;
pub mod ownership;

// SVM plumbing
pub mod msrpm;
pub mod intercept;
pub mod hw;

// Backend
pub mod ops;
pub mod amd;
pub mod dump;

pub mod error;

pub use amd::AmdVpmu;
pub use config::{VpmuConfig, VpmuMode};
pub use context::AmdPmuContext;
pub use dump::{RegisterDump, VpmuDump};
pub use error::{VpmuError, VpmuResult};
pub use flags::VpmuFlags;
pub use host::VpmuHost;
pub use hw::{EmulatedPmuMsrs, MsrAccess, MsrWrite, PmuResidency};
pub use layout::{cpu_family, LayoutTable};
pub use msrpm::{MsrIntercept, MsrPermissionMap};
pub use ops::{ArchVpmuOps, InitOutcome, SaveOutcome};
pub use ownership::{pmu_ownership, PmuOwner, PmuOwnership};
pub use vcpu::{vpmu_dump_domain, GuestKind, Vcpu, Vpmu};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
