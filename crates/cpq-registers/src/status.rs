//! Register: STATUS (read side)

/// STATUS
///
/// Coprocessor run state and signal bits, as returned by a read.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct StatusReg(u32);

impl crate::reg::Register for StatusReg {
    type Regwidth = u32;

    fn from_raw(val: Self::Regwidth) -> Self {
        Self(val)
    }

    fn to_raw(self) -> Self::Regwidth {
        self.0
    }
}

impl StatusReg {
    pub const HALTED: u32 = 1 << 0;
    pub const BROKE: u32 = 1 << 1;
    pub const DMA_BUSY: u32 = 1 << 2;
    pub const DMA_FULL: u32 = 1 << 3;
    pub const INTR: u32 = 1 << 4;
    pub const SIG_OFFSET: usize = 7;
    pub const SIG_MASK: u32 = 0xFF;

    /// Status bit for signal `n`.
    #[inline(always)]
    #[must_use]
    pub const fn sig(n: u8) -> u32 {
        assert!((n as usize) < crate::SIGNAL_COUNT);
        1 << (Self::SIG_OFFSET + n as usize)
    }

    #[inline(always)]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// HALTED: the coprocessor is not executing.
    #[inline(always)]
    #[must_use]
    pub const fn halted(&self) -> bool {
        self.0 & Self::HALTED != 0
    }

    /// BROKE: the coprocessor stopped on a fault.
    #[inline(always)]
    #[must_use]
    pub const fn broke(&self) -> bool {
        self.0 & Self::BROKE != 0
    }

    #[inline(always)]
    #[must_use]
    pub const fn dma_busy(&self) -> bool {
        self.0 & (Self::DMA_BUSY | Self::DMA_FULL) != 0
    }

    /// Interrupt line towards the CPU is asserted.
    #[inline(always)]
    #[must_use]
    pub const fn intr(&self) -> bool {
        self.0 & Self::INTR != 0
    }

    #[inline(always)]
    #[must_use]
    pub const fn signal(&self, n: u8) -> bool {
        self.0 & Self::sig(n) != 0
    }

    /// All eight signal bits, SIG0 in bit 0.
    #[inline(always)]
    #[must_use]
    pub const fn signals(&self) -> u8 {
        ((self.0 >> Self::SIG_OFFSET) & Self::SIG_MASK) as u8
    }
}

impl core::fmt::Debug for StatusReg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusReg")
            .field("halted", &self.halted())
            .field("broke", &self.broke())
            .field("dma_busy", &self.dma_busy())
            .field("intr", &self.intr())
            .field("signals", &format_args!("{:#010b}", self.signals()))
            .finish()
    }
}
