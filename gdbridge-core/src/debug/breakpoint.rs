//! Breakpoint management module.

use crate::target::Target;
use anyhow::{Context, Result};

/// Pass-through to the target's breakpoint unit. Breakpoint state lives in
/// the target, nothing is tracked here.
pub struct BreakpointManager;

impl BreakpointManager {
    pub fn new() -> Self {
        Self
    }

    /// Set a breakpoint. Returns `false` when the target refused it.
    pub fn set_breakpoint(&self, target: &mut dyn Target, address: u32) -> Result<bool> {
        let accepted = target
            .set_breakpoint(address)
            .with_context(|| format!("Failed to set breakpoint @ 0x{address:08X}"))?;
        if !accepted {
            log::warn!("Target has no breakpoint left for 0x{address:08X}");
        }
        Ok(accepted)
    }

    /// Clear a breakpoint. Clearing an address that holds none is not an error.
    pub fn clear_breakpoint(&self, target: &mut dyn Target, address: u32) -> Result<()> {
        target
            .remove_breakpoint(address)
            .with_context(|| format!("Failed to clear breakpoint @ 0x{address:08X}"))
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;

    #[test]
    fn test_breakpoints_reach_the_target() {
        let mut board = SimBoard::new();
        let monitor = board.monitor();
        let mgr = BreakpointManager::new();

        assert!(mgr.set_breakpoint(&mut board, 0x0800_0100).unwrap());
        assert_eq!(monitor.breakpoints(), vec![0x0800_0100]);
        mgr.clear_breakpoint(&mut board, 0x0800_0100).unwrap();
        mgr.clear_breakpoint(&mut board, 0x0800_0100).unwrap();
        assert!(monitor.breakpoints().is_empty());
    }

    #[test]
    fn test_refused_breakpoint() {
        let mut board = SimBoard::new();
        board.monitor().set_breakpoint_limit(0);
        assert!(!BreakpointManager::new().set_breakpoint(&mut board, 0x0800_0100).unwrap());
    }
}
