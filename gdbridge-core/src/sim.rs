//! In-memory Cortex-M board.
//!
//! Backs the daemon's `--mock` mode and the test suites. The run state can be
//! scripted through a [`SimMonitor`], which also records every call the
//! server makes so tests can check what reached the board.

use crate::target::{Board, CoreRegister, Flash, Target, TargetState, CORTEX_M_TARGET_XML};
use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const SIM_FLASH_BASE: u32 = 0x0800_0000;
pub const SIM_FLASH_SIZE: usize = 64 * 1024;
pub const SIM_PAGE_SIZE: usize = 1024;
pub const SIM_RAM_BASE: u32 = 0x2000_0000;
pub const SIM_RAM_SIZE: usize = 20 * 1024;
const DEFAULT_BREAKPOINT_LIMIT: usize = 6;
const THUMB_BIT: u32 = 1 << 24;

/// What happens once the core is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScript {
    /// Keep running until halted from outside.
    Forever,
    /// Report halted after this many state polls, like a breakpoint hit.
    HaltAfter(u32),
    /// Enter the given exception after this many state polls and spin there.
    ExceptionAfter { polls: u32, exception: u32 },
}

struct SimCore {
    registers: [u32; 17],
    ipsr: u32,
    state: TargetState,
    script: RunScript,
    polls: u32,
    memory: BTreeMap<u32, u8>,
    breakpoints: BTreeSet<u32>,
    breakpoint_limit: usize,
    flash_image: Vec<u8>,
    flash_initialized: bool,
    erase_count: u32,
    programmed: Vec<(u32, Vec<u8>)>,
    fail_program_at: Option<u32>,
    resets: u32,
    calls: Vec<&'static str>,
}

impl SimCore {
    fn new() -> Self {
        let mut registers = [0u32; 17];
        registers[16] = THUMB_BIT;
        Self {
            registers,
            ipsr: 0,
            state: TargetState::Halted,
            script: RunScript::Forever,
            polls: 0,
            memory: BTreeMap::new(),
            breakpoints: BTreeSet::new(),
            breakpoint_limit: DEFAULT_BREAKPOINT_LIMIT,
            flash_image: vec![0xff; SIM_FLASH_SIZE],
            flash_initialized: false,
            erase_count: 0,
            programmed: Vec::new(),
            fail_program_at: None,
            resets: 0,
            calls: Vec::new(),
        }
    }

    fn flash_offset(&self, address: u32) -> Option<usize> {
        let offset = address.checked_sub(SIM_FLASH_BASE)? as usize;
        (offset < self.flash_image.len()).then_some(offset)
    }

    fn read_byte(&self, address: u32) -> u8 {
        match self.flash_offset(address) {
            Some(offset) => self.flash_image[offset],
            None => self.memory.get(&address).copied().unwrap_or(0),
        }
    }

    fn read_word(&self, address: u32) -> u32 {
        let bytes: Vec<u8> = (0..4).map(|i| self.read_byte(address.wrapping_add(i))).collect();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Simulated board implementing both [`Target`] and [`Flash`].
pub struct SimBoard {
    core: Arc<Mutex<SimCore>>,
}

/// Inspection and scripting handle for a [`SimBoard`] that stays usable after
/// the board itself was handed to the server.
#[derive(Clone)]
pub struct SimMonitor {
    core: Arc<Mutex<SimCore>>,
}

fn lock(core: &Mutex<SimCore>) -> MutexGuard<'_, SimCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBoard {
    /// A halted core with erased flash.
    pub fn new() -> Self {
        Self { core: Arc::new(Mutex::new(SimCore::new())) }
    }

    pub fn monitor(&self) -> SimMonitor {
        SimMonitor { core: Arc::clone(&self.core) }
    }

    fn core(&self) -> MutexGuard<'_, SimCore> {
        lock(&self.core)
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, SimCore> {
        let mut core = self.core();
        core.calls.push(call);
        core
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMonitor {
    fn core(&self) -> MutexGuard<'_, SimCore> {
        lock(&self.core)
    }

    pub fn set_register(&self, reg: CoreRegister, value: u32) {
        let mut core = self.core();
        match reg {
            CoreRegister::Ipsr => core.ipsr = value,
            other => core.registers[usize::from(other.regsel())] = value,
        }
    }

    pub fn register(&self, reg: CoreRegister) -> u32 {
        let core = self.core();
        match reg {
            CoreRegister::Ipsr => core.ipsr,
            other => core.registers[usize::from(other.regsel())],
        }
    }

    pub fn state(&self) -> TargetState {
        self.core().state
    }

    pub fn set_state(&self, state: TargetState) {
        self.core().state = state;
    }

    /// Script the next run and restart the poll counter.
    pub fn set_run_script(&self, script: RunScript) {
        let mut core = self.core();
        core.script = script;
        core.polls = 0;
    }

    pub fn set_breakpoint_limit(&self, limit: usize) {
        self.core().breakpoint_limit = limit;
    }

    pub fn breakpoints(&self) -> Vec<u32> {
        self.core().breakpoints.iter().copied().collect()
    }

    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let core = self.core();
        (0..len).map(|i| core.read_byte(address.wrapping_add(i as u32))).collect()
    }

    /// Make `program_page` fail for the page at this flash offset.
    pub fn fail_program_at(&self, offset: u32) {
        self.core().fail_program_at = Some(offset);
    }

    /// `(offset, data)` of every programmed page, in call order.
    pub fn programmed_pages(&self) -> Vec<(u32, Vec<u8>)> {
        self.core().programmed.clone()
    }

    pub fn flash_image(&self) -> Vec<u8> {
        self.core().flash_image.clone()
    }

    pub fn erase_count(&self) -> u32 {
        self.core().erase_count
    }

    pub fn flash_initialized(&self) -> bool {
        self.core().flash_initialized
    }

    pub fn reset_count(&self) -> u32 {
        self.core().resets
    }

    /// Names of all collaborator calls made so far.
    pub fn calls(&self) -> Vec<&'static str> {
        self.core().calls.clone()
    }
}

impl Target for SimBoard {
    fn halt(&mut self) -> Result<()> {
        self.record("halt").state = TargetState::Halted;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.record("resume").state = TargetState::Running;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let mut core = self.record("step");
        core.registers[15] = core.registers[15].wrapping_add(2);
        core.state = TargetState::Halted;
        Ok(())
    }

    fn state(&mut self) -> Result<TargetState> {
        let mut core = self.record("state");
        if core.state == TargetState::Running {
            core.polls += 1;
            let script = core.script;
            match script {
                RunScript::Forever => {}
                RunScript::HaltAfter(polls) => {
                    if core.polls >= polls {
                        core.state = TargetState::Halted;
                        core.script = RunScript::Forever;
                    }
                }
                RunScript::ExceptionAfter { polls, exception } => {
                    if core.polls >= polls {
                        core.ipsr = exception;
                    }
                }
            }
        }
        Ok(core.state)
    }

    fn read_core_register(&mut self, reg: CoreRegister) -> Result<u32> {
        let core = self.record("read_core_register");
        Ok(match reg {
            CoreRegister::Ipsr => core.ipsr,
            other => core.registers[usize::from(other.regsel())],
        })
    }

    fn write_core_register(&mut self, reg: CoreRegister, value: u32) -> Result<()> {
        let mut core = self.record("write_core_register");
        match reg {
            CoreRegister::Ipsr => core.ipsr = value,
            other => core.registers[usize::from(other.regsel())] = value,
        }
        Ok(())
    }

    fn read_block_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let core = self.record("read_block_memory");
        Ok((0..len).map(|i| core.read_byte(address.wrapping_add(i as u32))).collect())
    }

    fn write_block_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut core = self.record("write_block_memory");
        if core.flash_offset(address).is_some() {
            bail!("Write to flash at 0x{address:08x} needs the flash programming commands");
        }
        for (i, &byte) in data.iter().enumerate() {
            core.memory.insert(address.wrapping_add(i as u32), byte);
        }
        Ok(())
    }

    fn set_breakpoint(&mut self, address: u32) -> Result<bool> {
        let mut core = self.record("set_breakpoint");
        if core.breakpoints.contains(&address) {
            return Ok(true);
        }
        if core.breakpoints.len() >= core.breakpoint_limit {
            return Ok(false);
        }
        core.breakpoints.insert(address);
        Ok(true)
    }

    fn remove_breakpoint(&mut self, address: u32) -> Result<()> {
        self.record("remove_breakpoint").breakpoints.remove(&address);
        Ok(())
    }

    fn reset_stop_on_reset(&mut self) -> Result<()> {
        let mut core = self.record("reset_stop_on_reset");
        core.resets += 1;
        let mut registers = [0u32; 17];
        registers[13] = core.read_word(SIM_FLASH_BASE);
        registers[15] = core.read_word(SIM_FLASH_BASE + 4) & !1;
        registers[16] = THUMB_BIT;
        core.registers = registers;
        core.ipsr = 0;
        core.state = TargetState::Halted;
        core.script = RunScript::Forever;
        Ok(())
    }

    fn register_description_xml(&self) -> String {
        CORTEX_M_TARGET_XML.to_string()
    }
}

impl Flash for SimBoard {
    fn init(&mut self) -> Result<()> {
        self.record("flash_init").flash_initialized = true;
        Ok(())
    }

    fn erase_all(&mut self) -> Result<()> {
        let mut core = self.record("erase_all");
        if !core.flash_initialized {
            bail!("Flash algorithm not initialised");
        }
        core.flash_image.fill(0xff);
        core.erase_count += 1;
        Ok(())
    }

    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let mut core = self.record("program_page");
        if core.fail_program_at == Some(offset) {
            bail!("Programming failed at flash offset 0x{offset:x}");
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > core.flash_image.len() {
            bail!("Page at 0x{offset:x} runs past the end of flash");
        }
        core.flash_image[start..end].copy_from_slice(data);
        core.programmed.push((offset, data.to_vec()));
        Ok(())
    }

    fn page_size(&self) -> usize {
        SIM_PAGE_SIZE
    }

    fn size(&self) -> usize {
        SIM_FLASH_SIZE
    }

    fn memory_map_xml(&self) -> String {
        format!(
            concat!(
                "<?xml version=\"1.0\"?>\n",
                "<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" ",
                "\"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n",
                "<memory-map>\n",
                "<memory type=\"flash\" start=\"0x{:x}\" length=\"0x{:x}\">",
                "<property name=\"blocksize\">0x{:x}</property></memory>\n",
                "<memory type=\"ram\" start=\"0x{:x}\" length=\"0x{:x}\"/>\n",
                "</memory-map>\n"
            ),
            SIM_FLASH_BASE, SIM_FLASH_SIZE, SIM_PAGE_SIZE, SIM_RAM_BASE, SIM_RAM_SIZE
        )
    }
}

impl Board for SimBoard {
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
    fn test_fresh_board_is_halted_in_thread_mode() {
        let mut board = SimBoard::new();
        assert_eq!(board.state().unwrap(), TargetState::Halted);
        assert_eq!(board.read_core_register(CoreRegister::Ipsr).unwrap(), 0);
    }

    #[test]
    fn test_halt_after_script() {
        let mut board = SimBoard::new();
        board.monitor().set_run_script(RunScript::HaltAfter(2));
        board.resume().unwrap();
        assert_eq!(board.state().unwrap(), TargetState::Running);
        assert_eq!(board.state().unwrap(), TargetState::Halted);
    }

    #[test]
    fn test_breakpoint_limit() {
        let mut board = SimBoard::new();
        board.monitor().set_breakpoint_limit(1);
        assert!(board.set_breakpoint(0x0800_0100).unwrap());
        assert!(!board.set_breakpoint(0x0800_0200).unwrap());
        board.remove_breakpoint(0x0800_0100).unwrap();
        assert!(board.set_breakpoint(0x0800_0200).unwrap());
    }

    #[test]
    fn test_reset_loads_vector_table() {
        let mut board = SimBoard::new();
        board.init().unwrap();
        board.erase_all().unwrap();
        let mut vectors = Vec::new();
        vectors.extend_from_slice(&0x2000_5000u32.to_le_bytes());
        vectors.extend_from_slice(&0x0800_0101u32.to_le_bytes());
        board.program_page(0, &vectors).unwrap();
        board.reset_stop_on_reset().unwrap();
        assert_eq!(board.read_core_register(CoreRegister::Sp).unwrap(), 0x2000_5000);
        assert_eq!(board.read_core_register(CoreRegister::Pc).unwrap(), 0x0800_0100);
    }

    #[test]
    fn test_erase_requires_init() {
        let mut board = SimBoard::new();
        assert!(board.erase_all().is_err());
    }
}
