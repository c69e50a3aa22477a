//! Consumer side of the command stream.
//!
//! [`Coprocessor`] is a host simulation of the dispatch firmware: it fetches
//! commands from the rings, follows JUMP/CALL/RET, swaps overlay state in and
//! out of DMEM and hands overlay commands to [`OverlayCode`]. It is an explicit
//! state machine stepped by its owner, either inline from a test or on a
//! dedicated thread.

mod coprocessor;
mod sim;

use cpq_registers::{StatusReg, WStatus, SP_STATUS};
use cpq_hal::RegisterPort;
use thiserror::Error;

use crate::memory::SharedMemory;

pub use coprocessor::{ConsumerState, ConsumerStats, ConsumerThread, Coprocessor};
pub use sim::SimRegisters;

/// Byte address of the boot descriptor written by the producer on init.
pub const BOOT_DESCRIPTOR: u32 = 0x40;

/// First word of a valid boot descriptor.
pub const BOOT_MAGIC: u32 = 0x4350_5130;

/// Word offsets inside the boot descriptor.
pub mod boot {
    pub const MAGIC: u32 = 0;
    pub const GENERATION: u32 = 1;
    pub const LOWPRI_BASE: u32 = 2;
    pub const LOWPRI_WORDS: u32 = 3;
    pub const LOWPRI_WP: u32 = 4;
    pub const LOWPRI_RP: u32 = 5;
    pub const HIGHPRI_BASE: u32 = 6;
    pub const HIGHPRI_WORDS: u32 = 7;
    pub const HIGHPRI_WP: u32 = 8;
    pub const HIGHPRI_RP: u32 = 9;
    pub const SYNCPOINT_MAILBOX: u32 = 10;
    pub const OVERLAY_TABLE: u32 = 11;
    pub const WORDS: u32 = 12;
}

/// Divergence detected while executing the stream. Terminal: the simulated
/// coprocessor latches BROKE and HALTED and stays faulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("boot descriptor magic {0:#010x} is invalid")]
    BadBootDescriptor(u32),

    #[error("invalid opcode in word {word:#010x} at {addr:#x}")]
    InvalidOpcode { addr: u32, word: u32 },

    #[error("overlay id {id:#x} at {addr:#x} is not registered")]
    UnregisteredOverlay { addr: u32, id: u8 },

    #[error("overlay header at {header:#x} is corrupt")]
    BadOverlayHeader { header: u32 },

    #[error("command {command} of overlay id {id:#x} at {addr:#x} does not exist")]
    UnknownCommand { addr: u32, id: u8, command: u16 },

    #[error("call slot {slot} at {addr:#x} is out of range")]
    BadCallSlot { addr: u32, slot: u32 },

    #[error("queue index {index} at {addr:#x} is out of range")]
    BadQueueIndex { addr: u32, index: u32 },

    #[error("fetch from {addr:#x} is outside memory")]
    FetchOutOfRange { addr: u32 },

    #[error("DMA of {len} bytes between RDRAM {rdram:#x} and DMEM {dmem:#x} is out of range")]
    DmaOutOfRange { rdram: u32, dmem: u32, len: u32 },

    #[error("overlay command {command} failed: {reason}")]
    Overlay { command: u16, reason: String },
}

/// Coprocessor-resident code for one overlay.
pub trait OverlayCode: Send + Sync {
    /// Execute command number `command` (relative to the overlay's first id).
    /// `words` is the whole command, first word included.
    fn execute(&self, ctx: &mut CommandContext<'_>, command: u16, words: &[u32])
        -> Result<(), Fault>;
}

/// What an overlay command can touch while it runs.
pub struct CommandContext<'a> {
    state: &'a mut [u32],
    mem: &'a SharedMemory,
    regs: &'a SimRegisters,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(state: &'a mut [u32], mem: &'a SharedMemory, regs: &'a SimRegisters) -> Self {
        Self { state, mem, regs }
    }

    /// The overlay's persistent state, resident in DMEM.
    pub fn state(&self) -> &[u32] {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut [u32] {
        self.state
    }

    pub fn rdram(&self) -> &SharedMemory {
        self.mem
    }

    pub fn status(&self) -> StatusReg {
        StatusReg::new(self.regs.read(SP_STATUS))
    }

    pub fn write_status(&self, mask: WStatus) {
        self.regs.write(SP_STATUS, mask.bits());
    }
}
