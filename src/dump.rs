//! vPMU diagnostic dump
//!
//! Snapshot of one vCPU's vPMU taken for the debug key handler. Each
//! register pair is shown with its shadow value next to the live hardware
//! value so the two can be compared.

use std::fmt;

use serde::Serialize;

use crate::error::VpmuResult;
use crate::vcpu::Vcpu;

/// One control/counter pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterDump {
    pub ctrl_msr: u32,
    pub ctrl_shadow: u64,
    pub ctrl_hw: u64,
    pub counter_msr: u32,
    pub counter_shadow: u64,
    pub counter_hw: u64,
}

impl RegisterDump {
    /// Shadow and hardware disagree
    pub fn diverged(&self) -> bool {
        self.ctrl_shadow != self.ctrl_hw || self.counter_shadow != self.counter_hw
    }
}

/// vPMU state of one vCPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpmuDump {
    pub domain_id: u32,
    pub vcpu_id: u32,
    pub flags: u32,
    pub flag_names: Vec<&'static str>,
    pub allocated: bool,
    pub registers: Vec<RegisterDump>,
}

impl VpmuDump {
    /// Flags only, for a vCPU without a shadow context
    pub fn flags_only(vcpu: &Vcpu) -> Self {
        Self {
            domain_id: vcpu.domain_id,
            vcpu_id: vcpu.id,
            flags: vcpu.vpmu().flags().bits(),
            flag_names: Vec::new(),
            allocated: false,
            registers: Vec::new(),
        }
    }

    /// Register pairs whose shadow differs from hardware
    pub fn diverged_registers(&self) -> impl Iterator<Item = &RegisterDump> {
        self.registers.iter().filter(|reg| reg.diverged())
    }

    pub fn to_json(&self) -> VpmuResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the dump to the host log, one line at a time.
    pub fn log(&self) {
        log::info!("d{}v{}", self.domain_id, self.vcpu_id);
        for line in self.to_string().lines() {
            log::info!("{}", line);
        }
    }
}

impl fmt::Display for VpmuDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    VPMU state: {:#x} ", self.flags)?;
        if !self.allocated {
            return writeln!(f);
        }

        write!(f, "(")?;
        for name in &self.flag_names {
            if *name != "ALLOCATED" {
                write!(f, "{}, ", name)?;
            }
        }
        writeln!(f, "ALLOCATED)")?;

        for reg in &self.registers {
            writeln!(
                f,
                "      {:#x}: {:#x} ({:#x} in HW)    {:#x}: {:#x} ({:#x} in HW)",
                reg.ctrl_msr, reg.ctrl_shadow, reg.ctrl_hw, reg.counter_msr, reg.counter_shadow, reg.counter_hw
            )?;
        }
        Ok(())
    }
}
