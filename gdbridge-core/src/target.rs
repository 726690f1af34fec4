//! Collaborator interfaces for the debugged microcontroller.
//!
//! The server never talks to a probe directly. Everything goes through a
//! [`Board`], which hands out the [`Target`] (core control, registers, memory,
//! breakpoints) and the [`Flash`] (erase and page programming) of the chip
//! currently attached.

use anyhow::Result;

/// Run state reported by the target core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Halted,
    Sleeping,
    LockedUp,
    Unknown,
}

impl TargetState {
    pub fn is_halted(self) -> bool {
        matches!(self, Self::Halted)
    }
}

/// Cortex-M core registers known to the server.
///
/// The first 17 variants are the `g` packet layout, in GDB's
/// `org.gnu.gdb.arm.m-profile` order. [`CoreRegister::Ipsr`] is only used to
/// decode the active exception number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRegister {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
    Xpsr,
    Ipsr,
}

impl CoreRegister {
    /// Registers in `g` packet order.
    pub const GDB_ORDER: [Self; 17] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::Sp,
        Self::Lr,
        Self::Pc,
        Self::Xpsr,
    ];

    /// Look up a register by its `p`/`P` packet number.
    pub fn from_gdb_index(index: usize) -> Option<Self> {
        Self::GDB_ORDER.get(index).copied()
    }

    /// Look up a register by name, as used in monitor commands and the
    /// register description.
    pub fn from_name(name: &str) -> Option<Self> {
        let reg = match name.to_ascii_lowercase().as_str() {
            "r0" => Self::R0,
            "r1" => Self::R1,
            "r2" => Self::R2,
            "r3" => Self::R3,
            "r4" => Self::R4,
            "r5" => Self::R5,
            "r6" => Self::R6,
            "r7" => Self::R7,
            "r8" => Self::R8,
            "r9" => Self::R9,
            "r10" => Self::R10,
            "r11" => Self::R11,
            "r12" => Self::R12,
            "sp" | "r13" => Self::Sp,
            "lr" | "r14" => Self::Lr,
            "pc" | "r15" => Self::Pc,
            "xpsr" => Self::Xpsr,
            "ipsr" => Self::Ipsr,
            _ => return None,
        };
        Some(reg)
    }

    /// Architectural register number (DCRSR REGSEL encoding) for the
    /// registers a debug probe can address directly. `Ipsr` is read via xPSR.
    pub fn regsel(self) -> u16 {
        match self {
            Self::Ipsr => 16,
            other => other as u16,
        }
    }
}

/// Core control, register, memory and breakpoint access to one target.
pub trait Target: Send {
    fn halt(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn step(&mut self) -> Result<()>;
    fn state(&mut self) -> Result<TargetState>;

    fn read_core_register(&mut self, reg: CoreRegister) -> Result<u32>;
    fn write_core_register(&mut self, reg: CoreRegister, value: u32) -> Result<()>;

    fn read_block_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;
    fn write_block_memory(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Returns `false` when the target has no breakpoint resource left.
    fn set_breakpoint(&mut self, address: u32) -> Result<bool>;
    fn remove_breakpoint(&mut self, address: u32) -> Result<()>;

    /// Reset the core and halt it on the reset vector.
    fn reset_stop_on_reset(&mut self) -> Result<()>;

    /// GDB target description (`target.xml`).
    fn register_description_xml(&self) -> String;
}

/// Flash programming access to one target.
pub trait Flash: Send {
    fn init(&mut self) -> Result<()>;
    fn erase_all(&mut self) -> Result<()>;
    /// Program `data` at `offset` bytes from the start of flash.
    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<()>;
    fn page_size(&self) -> usize;
    /// Total flash size in bytes; the most a load may write.
    fn size(&self) -> usize;
    /// GDB memory map (`memory-map` qXfer object).
    fn memory_map_xml(&self) -> String;
}

/// The attached chip: a target and its flash, swapped as one unit.
pub trait Board: Send {
    fn target(&mut self) -> &mut dyn Target;
    fn flash(&mut self) -> &mut dyn Flash;
}

/// Target description for ARMv6-M/ARMv7-M cores, register numbers matching
/// [`CoreRegister::GDB_ORDER`].
pub const CORTEX_M_TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
<architecture>arm</architecture>
<feature name="org.gnu.gdb.arm.m-profile">
<reg name="r0" bitsize="32" regnum="0" type="int" group="general"/>
<reg name="r1" bitsize="32" regnum="1" type="int" group="general"/>
<reg name="r2" bitsize="32" regnum="2" type="int" group="general"/>
<reg name="r3" bitsize="32" regnum="3" type="int" group="general"/>
<reg name="r4" bitsize="32" regnum="4" type="int" group="general"/>
<reg name="r5" bitsize="32" regnum="5" type="int" group="general"/>
<reg name="r6" bitsize="32" regnum="6" type="int" group="general"/>
<reg name="r7" bitsize="32" regnum="7" type="int" group="general"/>
<reg name="r8" bitsize="32" regnum="8" type="int" group="general"/>
<reg name="r9" bitsize="32" regnum="9" type="int" group="general"/>
<reg name="r10" bitsize="32" regnum="10" type="int" group="general"/>
<reg name="r11" bitsize="32" regnum="11" type="int" group="general"/>
<reg name="r12" bitsize="32" regnum="12" type="int" group="general"/>
<reg name="sp" bitsize="32" regnum="13" type="data_ptr" group="general"/>
<reg name="lr" bitsize="32" regnum="14" type="int" group="general"/>
<reg name="pc" bitsize="32" regnum="15" type="code_ptr" group="general"/>
<reg name="xpsr" bitsize="32" regnum="16" type="int" group="general"/>
</feature>
</target>
"#;
