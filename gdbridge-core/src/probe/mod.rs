//! Probe backed board.
//!
//! Finds debug probes, attaches to the chip behind one and exposes the
//! resulting session as a [`Board`].

use crate::target::{Board, CoreRegister, Flash, Target, TargetState, CORTEX_M_TARGET_XML};
use anyhow::{bail, Context, Result};
use probe_rs::config::MemoryRegion;
use probe_rs::flashing::{DownloadOptions, FlashProgress};
use probe_rs::probe::list::Lister;
use probe_rs::probe::{DebugProbeInfo, Probe};
use probe_rs::{Core, CoreStatus, MemoryInterface, Permissions, Session};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::ops::Range;
use std::time::Duration;

const HALT_TIMEOUT: Duration = Duration::from_millis(100);
const XPSR: u16 = 16;
const IPSR_MASK: u32 = 0x1ff;

/// Chip name that lets probe-rs identify the target itself.
pub const AUTO_CHIP: &str = "auto";

/// An attached debug probe as listed to the user.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub identifier: String,
}

impl From<&DebugProbeInfo> for ProbeInfo {
    fn from(info: &DebugProbeInfo) -> Self {
        Self {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial_number: info.serial_number.clone(),
            identifier: info.identifier.clone(),
        }
    }
}

impl std::fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:04X}:{:04X})", self.identifier, self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {serial}")?;
        }
        Ok(())
    }
}

/// Probe manager for enumerating probes and attaching to targets.
pub struct ProbeManager {
    lister: Lister,
}

impl ProbeManager {
    pub fn new() -> Self {
        Self { lister: Lister::new() }
    }

    pub fn list_probes(&self) -> Vec<ProbeInfo> {
        self.lister.list_all().iter().map(ProbeInfo::from).collect()
    }

    /// Open the probe at `index` in the listing.
    pub fn open_probe(&self, index: usize) -> Result<Probe> {
        let probes = self.lister.list_all();
        let info = probes
            .get(index)
            .with_context(|| format!("Probe index {index} out of range ({} found)", probes.len()))?;
        log::info!("Opening probe {}", ProbeInfo::from(info));
        info.open().context("Failed to open probe")
    }

    /// Attach to `chip` through the probe at `index`. Use [`AUTO_CHIP`] to
    /// let the chip be detected.
    pub fn attach(&self, index: usize, chip: &str) -> Result<Session> {
        let probe = self.open_probe(index)?;
        let session = probe
            .attach(chip, Permissions::default())
            .with_context(|| format!("Failed to attach to target {chip:?}"))?;
        log::info!("Attached to {}", session.target().name);
        Ok(session)
    }
}

impl Default for ProbeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A probe-rs session on core 0 of a Cortex-M target.
pub struct ProbeRsBoard {
    session: Session,
    page_size: usize,
    breakpoints: BTreeSet<u32>,
}

impl ProbeRsBoard {
    /// Wrap an attached session. `page_size` overrides the page size of the
    /// target's flash algorithm.
    pub fn new(session: Session, page_size: Option<usize>) -> Result<Self> {
        let page_size = match page_size {
            Some(size) => size,
            None => session
                .target()
                .flash_algorithms
                .first()
                .map(|algo| algo.flash_properties.page_size as usize)
                .context("Target has no flash algorithm, pass a page size")?,
        };
        log::debug!("Programming flash in {page_size} byte pages");
        Ok(Self { session, page_size, breakpoints: BTreeSet::new() })
    }

    fn core(&mut self) -> Result<Core<'_>> {
        self.session.core(0).context("Failed to open core 0")
    }

    fn flash_range(&self) -> Result<Range<u64>> {
        self.session
            .target()
            .memory_map
            .iter()
            .find_map(|region| match region {
                MemoryRegion::Nvm(nvm) => Some(nvm.range.clone()),
                _ => None,
            })
            .context("Target memory map has no flash region")
    }
}

impl Target for ProbeRsBoard {
    fn halt(&mut self) -> Result<()> {
        self.core()?.halt(HALT_TIMEOUT).context("Failed to halt core")?;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.core()?.run().context("Failed to resume core")
    }

    fn step(&mut self) -> Result<()> {
        self.core()?.step().context("Failed to step core")?;
        Ok(())
    }

    fn state(&mut self) -> Result<TargetState> {
        let status = self.core()?.status().context("Failed to get core status")?;
        Ok(match status {
            CoreStatus::Running => TargetState::Running,
            CoreStatus::Halted(_) => TargetState::Halted,
            CoreStatus::Sleeping => TargetState::Sleeping,
            CoreStatus::LockedUp => TargetState::LockedUp,
            CoreStatus::Unknown => TargetState::Unknown,
        })
    }

    fn read_core_register(&mut self, reg: CoreRegister) -> Result<u32> {
        let mut core = self.core()?;
        let value: u32 = core
            .read_core_reg(reg.regsel())
            .with_context(|| format!("Failed to read {reg:?}"))?;
        Ok(if reg == CoreRegister::Ipsr { value & IPSR_MASK } else { value })
    }

    fn write_core_register(&mut self, reg: CoreRegister, value: u32) -> Result<()> {
        let mut core = self.core()?;
        let value = if reg == CoreRegister::Ipsr {
            let xpsr: u32 = core.read_core_reg(XPSR).context("Failed to read xPSR")?;
            (xpsr & !IPSR_MASK) | (value & IPSR_MASK)
        } else {
            value
        };
        core.write_core_reg(reg.regsel(), value).with_context(|| format!("Failed to write {reg:?}"))
    }

    fn read_block_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.core()?.read_8(u64::from(address), &mut data).context("Failed to read memory block")?;
        Ok(data)
    }

    fn write_block_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.core()?.write_8(u64::from(address), data).context("Failed to write memory block")
    }

    /// Hardware breakpoints only. Refuses once every comparator is in use.
    fn set_breakpoint(&mut self, address: u32) -> Result<bool> {
        if self.breakpoints.contains(&address) {
            return Ok(true);
        }
        let in_use = self.breakpoints.len();
        let mut core = self.core()?;
        let units = core.available_breakpoint_units().context("Failed to query breakpoint units")?;
        if in_use >= units as usize {
            return Ok(false);
        }
        core.set_hw_breakpoint(u64::from(address))
            .with_context(|| format!("Failed to set hardware breakpoint @ 0x{address:08X}"))?;
        drop(core);
        self.breakpoints.insert(address);
        Ok(true)
    }

    fn remove_breakpoint(&mut self, address: u32) -> Result<()> {
        if !self.breakpoints.contains(&address) {
            return Ok(());
        }
        self.core()?
            .clear_hw_breakpoint(u64::from(address))
            .with_context(|| format!("Failed to clear hardware breakpoint @ 0x{address:08X}"))?;
        self.breakpoints.remove(&address);
        Ok(())
    }

    fn reset_stop_on_reset(&mut self) -> Result<()> {
        self.core()?.reset_and_halt(HALT_TIMEOUT).context("Failed to reset and halt core")?;
        Ok(())
    }

    fn register_description_xml(&self) -> String {
        CORTEX_M_TARGET_XML.to_string()
    }
}

impl Flash for ProbeRsBoard {
    /// The flash loader sets itself up per operation; this only checks one is
    /// available and stops the core so it does not run into half-erased code.
    fn init(&mut self) -> Result<()> {
        if self.session.target().flash_algorithms.is_empty() {
            bail!("No flash algorithm for {}", self.session.target().name);
        }
        self.halt()
    }

    fn erase_all(&mut self) -> Result<()> {
        probe_rs::flashing::erase_all(&mut self.session, &mut FlashProgress::new(|_| {}), false)
            .context("Failed to erase flash")
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let range = self.flash_range()?;
        let address = range.start + u64::from(offset);
        if address + data.len() as u64 > range.end {
            bail!("Page at 0x{address:08x} runs past the end of flash");
        }

        let mut loader = self.session.target().flash_loader();
        loader.add_data(address, data).context("Failed to stage flash page")?;
        let mut options = DownloadOptions::default();
        options.skip_erase = true;
        options.keep_unwritten_bytes = true;
        loader
            .commit(&mut self.session, options)
            .with_context(|| format!("Failed to program page @ 0x{address:08x}"))
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn size(&self) -> usize {
        self.flash_range()
            .ok()
            .and_then(|range| usize::try_from(range.end - range.start).ok())
            .unwrap_or(0)
    }

    fn memory_map_xml(&self) -> String {
        let mut xml = String::from(concat!(
            "<?xml version=\"1.0\"?>\n",
            "<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" ",
            "\"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n",
            "<memory-map>\n"
        ));
        for region in &self.session.target().memory_map {
            let _ = match region {
                MemoryRegion::Nvm(nvm) => writeln!(
                    xml,
                    "<memory type=\"flash\" start=\"0x{:x}\" length=\"0x{:x}\">\
                     <property name=\"blocksize\">0x{:x}</property></memory>",
                    nvm.range.start,
                    nvm.range.end - nvm.range.start,
                    self.page_size
                ),
                MemoryRegion::Ram(ram) => writeln!(
                    xml,
                    "<memory type=\"ram\" start=\"0x{:x}\" length=\"0x{:x}\"/>",
                    ram.range.start,
                    ram.range.end - ram.range.start
                ),
                _ => Ok(()),
            };
        }
        xml.push_str("</memory-map>\n");
        xml
    }
}

impl Board for ProbeRsBoard {
    fn target(&mut self) -> &mut dyn Target {
        self
    }

    fn flash(&mut self) -> &mut dyn Flash {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_info_display() {
        let info = ProbeInfo {
            vendor_id: 0x0483,
            product_id: 0x3748,
            serial_number: Some("ABC123".to_string()),
            identifier: "STLink V2".to_string(),
        };
        assert_eq!(info.to_string(), "STLink V2 (0483:3748) serial ABC123");

        let info = ProbeInfo { serial_number: None, ..info };
        assert_eq!(info.to_string(), "STLink V2 (0483:3748)");
    }

    #[test]
    #[ignore = "needs a debug probe with a target attached"]
    fn test_attach_and_read_pc() {
        let session = ProbeManager::new().attach(0, AUTO_CHIP).unwrap();
        let mut board = ProbeRsBoard::new(session, None).unwrap();
        board.halt().unwrap();
        assert_eq!(board.state().unwrap(), TargetState::Halted);
        let pc = board.read_core_register(CoreRegister::Pc).unwrap();
        assert_ne!(pc, 0);
        assert!(board.memory_map_xml().contains("type=\"flash\""));
    }
}
