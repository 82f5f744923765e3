//! vPMU errors

/// vPMU operation result
pub type VpmuResult<T> = Result<T, VpmuError>;

/// vPMU errors
///
/// Only conditions the caller has to report end up here. Ownership
/// contention, a disabled vPMU and the freeze path of a save are ordinary
/// outcomes and are returned as values instead.
#[derive(Debug, thiserror::Error)]
pub enum VpmuError {
    #[error("Unsupported CPU family {0:#x}")]
    UnsupportedFamily(u16),

    #[error("Register bank does not fit into vPMU shared page ({required} > {page_size} bytes)")]
    SharedPageOverflow {
        required: usize,
        page_size: usize,
    },

    #[error("Insufficient memory for PMU on domain {domain_id} vcpu {vcpu_id}")]
    InsufficientMemory {
        domain_id: u32,
        vcpu_id: u32,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
