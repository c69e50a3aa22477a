//! Register: STATUS (write side)
//!
//! Each controllable bit has an independent clear/set pair. Writing both bits
//! of a pair at once is undefined on hardware and rejected by [`WStatus::is_valid`].

use crate::status::StatusReg;

/// Write mask for the STATUS register.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct WStatus(u32);

impl crate::reg::Register for WStatus {
    type Regwidth = u32;

    fn from_raw(val: Self::Regwidth) -> Self {
        Self(val)
    }

    fn to_raw(self) -> Self::Regwidth {
        self.0
    }
}

impl WStatus {
    pub const CLEAR_HALT: u32 = 1 << 0;
    pub const SET_HALT: u32 = 1 << 1;
    pub const CLEAR_BROKE: u32 = 1 << 2;
    pub const CLEAR_INTR: u32 = 1 << 3;
    pub const SET_INTR: u32 = 1 << 4;
    pub const SIG_OFFSET: usize = 9;

    #[inline(always)]
    #[must_use]
    pub const fn clear_sig(n: u8) -> u32 {
        assert!((n as usize) < crate::SIGNAL_COUNT);
        1 << (Self::SIG_OFFSET + 2 * n as usize)
    }

    #[inline(always)]
    #[must_use]
    pub const fn set_sig(n: u8) -> u32 {
        assert!((n as usize) < crate::SIGNAL_COUNT);
        1 << (Self::SIG_OFFSET + 2 * n as usize + 1)
    }

    #[inline(always)]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if no clear/set pair has both halves set.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        let clears = self.0 & 0x5555_5555;
        let sets = (self.0 >> 1) & 0x5555_5555;
        // HALT is the pair at bits 0/1, BROKE has no set half, INTR is 3/4.
        let halt_conflict = clears & sets & 1;
        let intr_conflict = (self.0 >> 3) & (self.0 >> 4) & 1;
        let sig_pairs = self.0 >> Self::SIG_OFFSET;
        let sig_conflict = sig_pairs & (sig_pairs >> 1) & 0x5555;
        halt_conflict == 0 && intr_conflict == 0 && sig_conflict == 0
    }

    /// Apply this write mask to a current status value, returning the new
    /// register contents. This is the hardware write semantic, used by
    /// simulated register files.
    #[must_use]
    pub const fn apply(self, status: u32) -> u32 {
        let w = self.0;
        let mut s = status;
        if w & Self::CLEAR_HALT != 0 {
            s &= !StatusReg::HALTED;
        }
        if w & Self::SET_HALT != 0 {
            s |= StatusReg::HALTED;
        }
        if w & Self::CLEAR_BROKE != 0 {
            s &= !StatusReg::BROKE;
        }
        if w & Self::CLEAR_INTR != 0 {
            s &= !StatusReg::INTR;
        }
        if w & Self::SET_INTR != 0 {
            s |= StatusReg::INTR;
        }
        let mut n = 0;
        while n < crate::SIGNAL_COUNT as u8 {
            if w & Self::clear_sig(n) != 0 {
                s &= !StatusReg::sig(n);
            }
            if w & Self::set_sig(n) != 0 {
                s |= StatusReg::sig(n);
            }
            n += 1;
        }
        s
    }
}

impl core::ops::BitOr for WStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
