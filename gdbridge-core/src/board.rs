//! Exclusive, swappable access to the attached board.

use crate::target::{Board, Flash, Target};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The board plus a counter bumped on every swap, so holders of per-board
/// state (flash initialisation, pending writes) can tell the chip changed.
pub struct BoardSlot {
    board: Box<dyn Board>,
    generation: u64,
}

impl BoardSlot {
    pub fn target(&mut self) -> &mut dyn Target {
        self.board.target()
    }

    pub fn flash(&mut self) -> &mut dyn Flash {
        self.board.flash()
    }

    pub fn board(&mut self) -> &mut dyn Board {
        self.board.as_mut()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared handle to the board. Every target or flash access goes through
/// [`BoardHandle::lock`], which also serialises against [`BoardHandle::replace`].
#[derive(Clone)]
pub struct BoardHandle {
    slot: Arc<Mutex<BoardSlot>>,
}

impl BoardHandle {
    pub fn new(board: Box<dyn Board>) -> Self {
        Self { slot: Arc::new(Mutex::new(BoardSlot { board, generation: 0 })) }
    }

    /// Take the board lock. A panic on another thread while holding the lock
    /// does not make the board unusable.
    pub fn lock(&self) -> MutexGuard<'_, BoardSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a new board and return the old one. Waits for any in-flight
    /// command to release the lock first.
    pub fn replace(&self, board: Box<dyn Board>) -> Box<dyn Board> {
        let mut slot = self.lock();
        slot.generation += 1;
        log::info!("Board replaced (generation {})", slot.generation);
        std::mem::replace(&mut slot.board, board)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use crate::target::CoreRegister;

    #[test]
    fn test_replace_bumps_generation_and_routes_to_new_board() {
        let first = SimBoard::new();
        first.monitor().set_register(CoreRegister::R0, 1);
        let second = SimBoard::new();
        second.monitor().set_register(CoreRegister::R0, 2);

        let handle = BoardHandle::new(Box::new(first));
        assert_eq!(handle.generation(), 0);
        assert_eq!(handle.lock().target().read_core_register(CoreRegister::R0).unwrap(), 1);

        let _old = handle.replace(Box::new(second));
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.lock().target().read_core_register(CoreRegister::R0).unwrap(), 2);
    }
}
