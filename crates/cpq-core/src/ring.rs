//! Ring buffer allocator.
//!
//! One ring per queue. The producer owns `wp`; the consumer publishes its read
//! offset in a mailbox word the producer only reads. Offsets are in words.
//! `wp == rp` means empty, so the producer never lets `wp` catch up to `rp`
//! from behind. The word at `wp` is always zero (the terminator) so the
//! consumer never mistakes stale data for a command.

use cpq_hal::RegisterPort;
use log::{debug, warn};

use crate::command::internal;
use crate::memory::SharedMemory;

/// Where a command of a given size can go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Space {
    /// At the current write offset.
    Here,
    /// At offset 0, after a JUMP back to the start.
    Wrap,
    /// Nowhere until the consumer advances.
    Full,
}

/// Decide placement of `n` words with capacity `cap`, write offset `wp` and
/// read offset `rp`. One word past the command is always kept for the
/// terminator (or the JUMP written on wrap).
pub(crate) const fn space(cap: u32, wp: u32, rp: u32, n: u32) -> Space {
    if wp >= rp {
        if wp + n < cap {
            Space::Here
        } else if n < rp {
            Space::Wrap
        } else {
            Space::Full
        }
    } else if wp + n < rp {
        Space::Here
    } else {
        Space::Full
    }
}

/// Producer-side state of one ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ring {
    base: u32,
    words: u32,
    wp: u32,
    wrap: u32,
    wp_addr: u32,
    rp_addr: u32,
}

impl Ring {
    /// Allocate a ring of `words` words. `wp_addr`/`rp_addr` are the cursor
    /// mailboxes shared with the consumer.
    pub(crate) fn allocate(mem: &SharedMemory, words: u32, wp_addr: u32, rp_addr: u32) -> Self {
        let base = match mem.alloc(words * 4) {
            Some(base) => base,
            None => panic!("out of shared memory for a {words}-word ring"),
        };
        mem.store_release(wp_addr, 0);
        mem.store_release(rp_addr, 0);
        Self {
            base,
            words,
            wp: 0,
            wrap: 0,
            wp_addr,
            rp_addr,
        }
    }

    pub(crate) fn release(&mut self, mem: &SharedMemory) {
        if self.base != 0 {
            mem.free(self.base);
        }
        *self = Self::default();
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.words
    }

    pub fn write_offset(&self) -> u32 {
        self.wp
    }

    /// Highest offset that held valid data before the last wrap.
    pub fn wrap_mark(&self) -> u32 {
        self.wrap
    }

    pub fn wp_addr(&self) -> u32 {
        self.wp_addr
    }

    pub fn rp_addr(&self) -> u32 {
        self.rp_addr
    }

    /// The consumer's last published read offset.
    pub fn read_offset(&self, mem: &SharedMemory) -> u32 {
        mem.load_acquire(self.rp_addr)
    }

    /// True once the consumer has fetched everything published.
    pub fn drained(&self, mem: &SharedMemory) -> bool {
        self.read_offset(mem) == self.wp
    }

    /// Reserve `n` words and return their byte address.
    ///
    /// Spins, re-reading the consumer's read offset, while the ring is full.
    pub(crate) fn reserve<P: RegisterPort>(
        &mut self,
        mem: &SharedMemory,
        port: &P,
        n: u32,
        spin_warn: u32,
    ) -> u32 {
        let mut spins = 0u32;
        loop {
            let rp = self.read_offset(mem);
            match space(self.words, self.wp, rp, n) {
                Space::Here => return self.base + self.wp * 4,
                Space::Wrap => {
                    // Clear the stale first word before the JUMP makes it
                    // reachable.
                    mem.write(self.base, 0);
                    mem.store_release(self.base + self.wp * 4, internal::jump(self.base));
                    debug!("ring {:#x}: wrap at word {}", self.base, self.wp);
                    self.wrap = self.wp;
                    self.wp = 0;
                    return self.base;
                }
                Space::Full => {
                    spins += 1;
                    if spins == spin_warn {
                        warn!(
                            "ring {:#x}: full for {spins} spins (wp={}, rp={rp})",
                            self.base, self.wp
                        );
                    }
                    port.idle();
                }
            }
        }
    }

    /// Advance past `n` committed words and publish the new write offset.
    /// The command and its terminator must already be in memory.
    pub(crate) fn commit(&mut self, mem: &SharedMemory, n: u32) {
        self.wp += n;
        if self.wp > self.wrap {
            self.wrap = self.wp;
        }
        mem.store_release(self.wp_addr, self.wp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_in_place() {
        assert_eq!(space(64, 0, 0, 16), Space::Here);
        assert_eq!(space(64, 47, 10, 16), Space::Here);
    }

    #[test]
    fn test_space_keeps_terminator_slot() {
        // 48 + 16 would leave no room for the terminator.
        assert_eq!(space(64, 48, 20, 16), Space::Wrap);
        assert_eq!(space(64, 48, 16, 16), Space::Full);
        assert_eq!(space(64, 48, 17, 16), Space::Wrap);
    }

    #[test]
    fn test_space_after_wrap() {
        // Producer is a lap ahead; must stay strictly behind rp.
        assert_eq!(space(64, 4, 40, 16), Space::Here);
        assert_eq!(space(64, 24, 40, 16), Space::Full);
        assert_eq!(space(64, 23, 40, 16), Space::Here);
    }

    #[test]
    fn test_space_empty_ring_at_end() {
        assert_eq!(space(64, 60, 60, 8), Space::Wrap);
    }
}
