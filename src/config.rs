//! vPMU configuration
//!
//! Read once at host boot, either from a YAML file or from the `vpmu=`
//! boot parameter.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VpmuError, VpmuResult};
use crate::shared;

/// vPMU operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpmuMode {
    /// No PMU virtualization
    Off,
    /// Guests profile themselves
    #[serde(rename = "self")]
    SelfOnly,
    /// Guests and the hypervisor
    Hv,
    /// Everything, including other domains
    All,
}

impl VpmuMode {
    pub fn is_off(self) -> bool {
        self == VpmuMode::Off
    }
}

impl Default for VpmuMode {
    fn default() -> Self {
        VpmuMode::Off
    }
}

impl std::str::FromStr for VpmuMode {
    type Err = VpmuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" | "no" | "false" => Ok(VpmuMode::Off),
            "self" | "on" | "1" | "yes" | "true" => Ok(VpmuMode::SelfOnly),
            "hv" => Ok(VpmuMode::Hv),
            "all" => Ok(VpmuMode::All),
            _ => Err(VpmuError::Config(format!("Unknown vpmu mode: {}", s))),
        }
    }
}

/// Host-wide vPMU configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpmuConfig {
    pub mode: VpmuMode,
    /// Size of the per-vCPU shared PMU page
    pub shared_page_size: usize,
    /// Use this CPU family instead of the detected one
    pub cpu_family: Option<u16>,
}

impl Default for VpmuConfig {
    fn default() -> Self {
        Self {
            mode: VpmuMode::Off,
            shared_page_size: shared::PAGE_SIZE,
            cpu_family: None,
        }
    }
}

impl VpmuConfig {
    /// Configuration with the given mode and defaults otherwise
    pub fn with_mode(mode: VpmuMode) -> Self {
        Self { mode, ..Self::default() }
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> VpmuResult<Self> {
        serde_yaml::from_str(content).map_err(|e| VpmuError::Config(e.to_string()))
    }

    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> VpmuResult<Self> {
        if !path.exists() {
            log::debug!("VPMU: no config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply a `vpmu=<mode>` boot parameter
    pub fn apply_boot_param(&mut self, value: &str) -> VpmuResult<()> {
        self.mode = value.parse()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("off".parse::<VpmuMode>().unwrap(), VpmuMode::Off);
        assert_eq!("ON".parse::<VpmuMode>().unwrap(), VpmuMode::SelfOnly);
        assert_eq!("self".parse::<VpmuMode>().unwrap(), VpmuMode::SelfOnly);
        assert_eq!(" all ".parse::<VpmuMode>().unwrap(), VpmuMode::All);
        assert!(matches!("bts".parse::<VpmuMode>(), Err(VpmuError::Config(_))));
    }

    #[test]
    fn test_defaults() {
        let config = VpmuConfig::default();
        assert!(config.mode.is_off());
        assert_eq!(config.shared_page_size, 4096);
        assert_eq!(config.cpu_family, None);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = VpmuConfig::from_yaml("mode: self\ncpu_family: 21\n").unwrap();
        assert_eq!(config.mode, VpmuMode::SelfOnly);
        assert_eq!(config.cpu_family, Some(0x15));
        assert_eq!(config.shared_page_size, shared::PAGE_SIZE);

        assert!(VpmuConfig::from_yaml("mode: sometimes\n").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: hv").unwrap();
        writeln!(file, "shared_page_size: 300").unwrap();

        let config = VpmuConfig::load(file.path()).unwrap();
        assert_eq!(config.mode, VpmuMode::Hv);
        assert_eq!(config.shared_page_size, 300);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = VpmuConfig::load(&dir.path().join("vpmu.yaml")).unwrap();
        assert_eq!(config, VpmuConfig::default());
    }

    #[test]
    fn test_boot_param() {
        let mut config = VpmuConfig::default();
        config.apply_boot_param("on").unwrap();
        assert_eq!(config.mode, VpmuMode::SelfOnly);
        assert!(config.apply_boot_param("maybe").is_err());
        assert_eq!(config.mode, VpmuMode::SelfOnly);
    }
}
