//! High-priority queue.
//!
//! Entering high-priority mode writes a SWAP_BUFFERS into the primary ring
//! and sends every following writer call to the second ring right away. The
//! consumer switches over when it reaches the swap, runs the high-priority
//! commands up to the closing swap, then resumes the primary ring. Brackets
//! run in the order their opening swaps appear in the primary ring.

use cpq_hal::{InterruptController, RegisterPort};
use cpq_registers::{WStatus, SIG_HIGHPRI_RUNNING};
use log::{debug, warn};

use crate::command::{internal, OverlayId};
use crate::queue::{Queue, QueueMode};

impl<P: RegisterPort + InterruptController> Queue<P> {
    /// Start a high-priority bracket.
    ///
    /// # Panics
    ///
    /// Panics if already in high-priority mode or recording a block.
    pub fn highpri_begin(&mut self) {
        assert!(
            self.mode != QueueMode::HighPriority,
            "already in high-priority mode"
        );
        assert!(
            self.mode != QueueMode::Recording,
            "cannot enter high-priority mode while recording a block"
        );
        self.swap(internal::QUEUE_HIGHPRI, internal::QUEUE_LOWPRI, WStatus::set_sig(SIG_HIGHPRI_RUNNING));
        self.mode = QueueMode::HighPriority;
        debug!("high-priority bracket opened at word {}", self.highpri.write_offset());
    }

    /// Close the bracket and return to the primary ring.
    pub fn highpri_end(&mut self) {
        assert!(
            self.mode == QueueMode::HighPriority,
            "not in high-priority mode"
        );
        self.swap(internal::QUEUE_LOWPRI, internal::QUEUE_HIGHPRI, WStatus::clear_sig(SIG_HIGHPRI_RUNNING));
        self.flush();
        self.mode = QueueMode::Normal;
        // Overlays unregistered inside the bracket.
        self.fence_retired();
        debug!("high-priority bracket closed at word {}", self.highpri.write_offset());
    }

    /// Block until every closed bracket has run.
    pub fn highpri_sync(&mut self) {
        assert!(
            self.mode != QueueMode::HighPriority,
            "cannot sync the high-priority queue from inside a bracket"
        );
        if !self.is_initialized() {
            return;
        }
        self.flush();
        let mut spins = 0u32;
        while !self.highpri.drained(&self.mem) {
            self.poll_deferred();
            spins += 1;
            if spins == self.config.spin_warn_threshold {
                warn!("high-priority queue not drained after {spins} spins");
            }
            self.port.idle();
        }
    }

    pub fn in_highpri(&self) -> bool {
        self.mode == QueueMode::HighPriority
    }

    fn swap(&mut self, to: u32, from: u32, status: u32) {
        let mut w = self.write_begin(OverlayId::INTERNAL, internal::SWAP_BUFFERS, 3);
        w.first(to);
        w.args(&[from, status]);
        w.end();
    }
}
