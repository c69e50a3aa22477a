//! Command word encoding.
//!
//! A command is 1 to [`MAX_COMMAND_SIZE`] words. The top byte of the first
//! word is the opcode: overlay id in the high nibble, command id in the low
//! nibble. The low 24 bits of the first word are free for immediate payload.

/// Largest command the consumer will fetch, in words.
pub const MAX_COMMAND_SIZE: usize = 16;

/// Number of overlay ids addressable by the opcode's high nibble.
pub const OVERLAY_ID_COUNT: usize = 16;

/// Commands addressable per overlay id.
pub const COMMANDS_PER_ID: usize = 16;

/// Mask for the first word's immediate payload.
pub const PAYLOAD_MASK: u32 = 0x00FF_FFFF;

/// Overlay id, the opcode's high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayId(u8);

impl OverlayId {
    /// Reserved for the queue's own commands.
    pub const INTERNAL: OverlayId = OverlayId(0);

    /// # Panics
    ///
    /// Panics if `id` does not fit in 4 bits.
    pub const fn new(id: u8) -> Self {
        assert!((id as usize) < OVERLAY_ID_COUNT, "overlay id out of range");
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Opcode byte for command `cmd` of this id.
    pub const fn opcode(self, cmd: u8) -> u8 {
        assert!((cmd as usize) < COMMANDS_PER_ID, "command id out of range");
        (self.0 << 4) | cmd
    }
}

impl core::fmt::Display for OverlayId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// First word of a command: opcode in the top byte, payload below.
#[inline]
pub const fn word0(opcode: u8, payload: u32) -> u32 {
    ((opcode as u32) << 24) | (payload & PAYLOAD_MASK)
}

/// Split a first word into (overlay id, command id).
#[inline]
pub const fn decode(word0: u32) -> (u8, u8) {
    let op = (word0 >> 24) as u8;
    (op >> 4, op & 0xF)
}

/// Commands of the reserved overlay 0, executed by the dispatch loop itself.
pub mod internal {
    use super::{word0, OverlayId};

    /// Never dispatched; marks the end of valid data.
    pub const INVALID: u8 = 0x00;
    pub const NOOP: u8 = 0x01;
    /// Continue fetching at the address in the payload.
    pub const JUMP: u8 = 0x02;
    /// Save the return address in a call slot, then jump.
    pub const CALL: u8 = 0x03;
    /// Resume from a call slot.
    pub const RET: u8 = 0x04;
    /// Copy between RDRAM and DMEM.
    pub const DMA: u8 = 0x05;
    /// Write a set/clear mask to the status register.
    pub const WRITE_STATUS: u8 = 0x06;
    /// Switch between the primary and high-priority rings.
    pub const SWAP_BUFFERS: u8 = 0x07;
    /// Publish a syncpoint id and raise the CPU interrupt.
    pub const SYNCPOINT: u8 = 0x08;

    /// DMA flag: copy DMEM to RDRAM instead of RDRAM to DMEM.
    pub const DMA_TO_RDRAM: u32 = 1 << 31;

    /// Queue indices used by SWAP_BUFFERS.
    pub const QUEUE_LOWPRI: u32 = 0;
    pub const QUEUE_HIGHPRI: u32 = 1;

    /// Word count of an internal command, or `None` for an id that does not
    /// exist.
    pub const fn size(cmd: u8) -> Option<usize> {
        match cmd {
            NOOP | JUMP | RET => Some(1),
            CALL | WRITE_STATUS => Some(2),
            SWAP_BUFFERS | SYNCPOINT => Some(3),
            DMA => Some(4),
            _ => None,
        }
    }

    /// Encoded JUMP to `addr`.
    pub const fn jump(addr: u32) -> u32 {
        word0(OverlayId::INTERNAL.opcode(JUMP), addr)
    }

    /// Encoded RET through call slot `slot`.
    pub const fn ret(slot: u32) -> u32 {
        word0(OverlayId::INTERNAL.opcode(RET), slot << 2)
    }
}
