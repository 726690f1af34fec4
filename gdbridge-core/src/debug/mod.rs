//! Debug control module.
//!
//! Handles core debug operations: halt, resume, step, register access and the
//! stop signal reported to GDB.

pub mod breakpoint;
pub mod resume;
pub mod signal;

pub use breakpoint::BreakpointManager;
pub use resume::{ResumeLoop, ResumeOutcome};
pub use signal::{signal_for, Exception, Signal};

use crate::protocol::packet::encode_u32_le;
use crate::target::{CoreRegister, Target, TargetState};
use anyhow::{Context, Result};

/// Manager for debug operations.
pub struct DebugManager;

impl DebugManager {
    pub fn new() -> Self {
        Self
    }

    /// Halt the core.
    pub fn halt(&self, target: &mut dyn Target) -> Result<()> {
        target.halt().context("Failed to halt core")
    }

    /// Resume the core.
    pub fn resume(&self, target: &mut dyn Target) -> Result<()> {
        target.resume().context("Failed to resume core")
    }

    /// Step the core by one instruction.
    pub fn step(&self, target: &mut dyn Target) -> Result<()> {
        target.step().context("Failed to step core")
    }

    /// Get the current status of the core.
    pub fn status(&self, target: &mut dyn Target) -> Result<TargetState> {
        target.state().context("Failed to get core status")
    }

    /// Active exception, from IPSR.
    pub fn exception(&self, target: &mut dyn Target) -> Result<Exception> {
        let ipsr = target.read_core_register(CoreRegister::Ipsr).context("Failed to read IPSR")?;
        Ok(Exception::from_ipsr(ipsr))
    }

    /// Signal describing why the core is stopped.
    pub fn last_signal(&self, target: &mut dyn Target) -> Result<Signal> {
        Ok(signal_for(self.exception(target)?))
    }

    /// All `g` packet registers, each as 8 little-endian hex digits.
    pub fn read_registers(&self, target: &mut dyn Target) -> Result<String> {
        let mut out = String::with_capacity(CoreRegister::GDB_ORDER.len() * 8);
        for reg in CoreRegister::GDB_ORDER {
            let value = target
                .read_core_register(reg)
                .with_context(|| format!("Failed to read core register {reg:?}"))?;
            out.push_str(&encode_u32_le(value));
        }
        Ok(out)
    }

    /// One register by `p` packet number.
    pub fn read_register(&self, target: &mut dyn Target, index: usize) -> Result<String> {
        let reg = CoreRegister::from_gdb_index(index)
            .with_context(|| format!("No core register number {index}"))?;
        let value = target
            .read_core_register(reg)
            .with_context(|| format!("Failed to read core register {reg:?}"))?;
        Ok(encode_u32_le(value))
    }

    /// One register by `P` packet number. `value` is already in host order.
    pub fn write_register(&self, target: &mut dyn Target, index: usize, value: u32) -> Result<()> {
        let reg = CoreRegister::from_gdb_index(index)
            .with_context(|| format!("No core register number {index}"))?;
        target
            .write_core_register(reg, value)
            .with_context(|| format!("Failed to write core register {reg:?}"))
    }
}

impl Default for DebugManager {
    fn default() -> Self {
        Self::new()
    }
}
