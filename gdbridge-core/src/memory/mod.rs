//! Memory access module.
//!
//! Handles reading and writing target memory for the `m`, `M` and `X` packets.

use crate::target::Target;
use anyhow::{Context, Result};

/// Manager for memory operations.
pub struct MemoryManager;

impl MemoryManager {
    pub fn new() -> Self {
        Self
    }

    /// Read a block of memory.
    pub fn read_block(&self, target: &mut dyn Target, address: u32, size: usize) -> Result<Vec<u8>> {
        let data = target
            .read_block_memory(address, size)
            .with_context(|| format!("Failed to read {size} bytes @ 0x{address:08X}"))?;
        anyhow::ensure!(
            data.len() == size,
            "Target returned {} bytes for a {size} byte read @ 0x{address:08X}",
            data.len()
        );
        Ok(data)
    }

    /// Read a block of memory as the hex string sent back for `m`.
    pub fn read_block_hex(&self, target: &mut dyn Target, address: u32, size: usize) -> Result<String> {
        Ok(hex::encode(self.read_block(target, address, size)?))
    }

    /// Write a block of memory. An empty write only probes for `X` support.
    pub fn write_block(&self, target: &mut dyn Target, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        target
            .write_block_memory(address, data)
            .with_context(|| format!("Failed to write {} bytes @ 0x{address:08X}", data.len()))
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoard, SIM_RAM_BASE};

    #[test]
    fn test_write_then_read() {
        let mut board = SimBoard::new();
        let mgr = MemoryManager::new();
        mgr.write_block(&mut board, SIM_RAM_BASE, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(mgr.read_block_hex(&mut board, SIM_RAM_BASE, 4).unwrap(), "deadbeef");
        assert_eq!(mgr.read_block_hex(&mut board, SIM_RAM_BASE + 2, 4).unwrap(), "beef0000");
    }

    #[test]
    fn test_empty_write_is_a_no_op() {
        let mut board = SimBoard::new();
        let monitor = board.monitor();
        MemoryManager::new().write_block(&mut board, SIM_RAM_BASE, &[]).unwrap();
        assert!(monitor.calls().is_empty());
    }

    #[test]
    fn test_target_failure_carries_context() {
        let mut board = SimBoard::new();
        let err = MemoryManager::new().write_block(&mut board, 0x0800_0000, &[1]).unwrap_err();
        assert!(format!("{err:#}").contains("0x08000000"));
    }
}
