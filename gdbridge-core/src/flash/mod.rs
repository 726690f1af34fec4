//! Flash management module.
//!
//! Collects the data of a GDB `load` (`vFlashErase`, `vFlashWrite`...,
//! `vFlashDone`) and programs it page by page.
//!
//! Writes are appended to one buffer in arrival order. The address of each
//! `vFlashWrite` is logged but not used for placement: the image is assumed to
//! start at the beginning of flash and to arrive contiguous and in order. The
//! buffer never grows past the size of the flash.

use crate::board::BoardSlot;
use anyhow::{bail, Context, Result};

/// Progress information for flash operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashingProgress {
    Erasing,
    Programming { total: usize },
    Progress { written: usize, total: usize },
    Finished,
    Failed(String),
}

/// Where the pipeline is in a load sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Erasing,
    Accumulating,
    Programming,
}

/// State of one flash load sequence.
pub struct FlashPipeline {
    state: FlashState,
    buffer: Vec<u8>,
    next_address: Option<u32>,
    /// Board generation the flash algorithm was initialised for.
    initialized_for: Option<u64>,
    /// Set when a board swap cut a load short; the next `done` fails.
    interrupted: bool,
}

impl FlashPipeline {
    pub fn new() -> Self {
        Self {
            state: FlashState::Idle,
            buffer: Vec::new(),
            next_address: None,
            initialized_for: None,
            interrupted: false,
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// `vFlashErase`: erase the whole chip.
    ///
    /// The first erase on a board also initialises its flash algorithm. GDB
    /// sends one erase per region; only the first of a run erases, the chip is
    /// already blank for the rest.
    pub fn erase(
        &mut self,
        slot: &mut BoardSlot,
        address: u32,
        length: usize,
        progress: &mut dyn FnMut(FlashingProgress),
    ) -> Result<()> {
        self.discard_if_board_changed(slot.generation());
        self.interrupted = false;

        if self.state == FlashState::Erasing {
            log::debug!("Region 0x{address:08x}+0x{length:x} already covered by chip erase");
            return Ok(());
        }
        if !self.buffer.is_empty() {
            log::warn!("Erase requested with {} bytes pending, discarding them", self.buffer.len());
            self.buffer.clear();
        }

        if self.initialized_for != Some(slot.generation()) {
            slot.flash().init().context("Failed to initialise flash")?;
            self.initialized_for = Some(slot.generation());
        }

        log::info!("Erasing flash (requested 0x{address:08x}+0x{length:x})");
        progress(FlashingProgress::Erasing);
        self.state = FlashState::Erasing;
        if let Err(e) = slot.flash().erase_all() {
            self.state = FlashState::Idle;
            return Err(e.context("Failed to erase flash"));
        }
        self.next_address = None;
        Ok(())
    }

    /// `vFlashWrite`: append already unescaped data.
    ///
    /// Fails without buffering anything when the image would outgrow the
    /// flash, or when a board swap already cut this load short.
    pub fn write(&mut self, slot: &mut BoardSlot, address: u32, data: &[u8]) -> Result<()> {
        self.discard_if_board_changed(slot.generation());
        if self.interrupted {
            bail!("Board changed during the flash load");
        }
        let capacity = slot.flash().size();
        if self.buffer.len() + data.len() > capacity {
            bail!(
                "Flash write of {} bytes for 0x{address:08x} overflows the {capacity} byte flash",
                data.len()
            );
        }

        log::debug!("Flash write of {} bytes for 0x{address:08x}", data.len());
        if self.state == FlashState::Idle {
            log::warn!("Flash write without a preceding erase");
        }
        if let Some(expected) = self.next_address {
            if expected != address {
                log::warn!(
                    "Flash write for 0x{address:08x} is not contiguous with the previous one \
                     (expected 0x{expected:08x}); appending anyway"
                );
            }
        }
        self.next_address = address.checked_add(data.len() as u32);
        self.buffer.extend_from_slice(data);
        self.state = FlashState::Accumulating;
        Ok(())
    }

    /// `vFlashDone`: program the buffered image and reset the target into a
    /// halted state.
    ///
    /// A failing page aborts the sequence: the buffer is dropped, the target
    /// is not reset and the error is returned. So does a load whose data was
    /// dropped by a board swap.
    pub fn done(
        &mut self,
        slot: &mut BoardSlot,
        progress: &mut dyn FnMut(FlashingProgress),
    ) -> Result<()> {
        self.discard_if_board_changed(slot.generation());
        if std::mem::take(&mut self.interrupted) {
            let reason = "Board changed during the flash load, nothing was programmed";
            progress(FlashingProgress::Failed(reason.to_string()));
            bail!(reason);
        }

        let image = std::mem::take(&mut self.buffer);
        self.next_address = None;
        self.state = FlashState::Programming;

        let result = Self::program(slot, &image, progress);
        self.state = FlashState::Idle;
        if let Err(e) = result {
            progress(FlashingProgress::Failed(format!("{e:#}")));
            return Err(e);
        }

        slot.target().reset_stop_on_reset().context("Failed to reset target after programming")?;
        progress(FlashingProgress::Finished);
        Ok(())
    }

    fn program(
        slot: &mut BoardSlot,
        image: &[u8],
        progress: &mut dyn FnMut(FlashingProgress),
    ) -> Result<()> {
        let flash = slot.flash();
        let page_size = flash.page_size();
        if page_size == 0 {
            bail!("Flash reports a page size of zero");
        }

        let total = image.len();
        log::info!("Programming {total} bytes in {page_size} byte pages");
        progress(FlashingProgress::Programming { total });

        let mut written = 0;
        for page in image.chunks(page_size) {
            let offset = u32::try_from(written).context("Image larger than the address space")?;
            flash
                .program_page(offset, page)
                .with_context(|| format!("Failed to program page at offset 0x{offset:x}"))?;
            written += page.len();
            progress(FlashingProgress::Progress { written, total });
        }
        Ok(())
    }

    fn discard_if_board_changed(&mut self, generation: u64) {
        if self.initialized_for.is_some_and(|g| g != generation) {
            if self.state != FlashState::Idle {
                log::warn!("Board changed during a flash load, dropping {} bytes", self.buffer.len());
                self.interrupted = true;
            }
            self.buffer.clear();
            self.next_address = None;
            self.initialized_for = None;
            self.state = FlashState::Idle;
        }
    }
}

impl Default for FlashPipeline {
    fn default() -> Self {
        Self::new()
    }
}
