//! Queue sizing policy and protocol limits.

/// Maximum block nesting depth; bounded by the consumer's call slots.
pub const MAX_BLOCK_NESTING: u32 = 8;

/// Coprocessor data memory size in bytes.
pub const DMEM_SIZE: u32 = 4096;

/// DMEM offset of the overlay table mirror.
pub const DMEM_OVERLAY_TABLE: u32 = 0x000;

/// DMEM offset of the current overlay's state window.
pub const DMEM_STATE_WINDOW: u32 = 0x200;

/// Largest overlay state window, in bytes.
pub const MAX_OVERLAY_STATE: u32 = DMEM_SIZE - DMEM_STATE_WINDOW;

/// Pending deferred callbacks before `syncpoint_new_with_callback` waits
/// for the oldest one.
pub const DEFERRED_CAPACITY: usize = 32;

/// Sizing policy chosen by the integrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Capacity of the primary ring, in words.
    pub lowpri_ring_words: u32,
    /// Capacity of the high-priority ring, in words.
    pub highpri_ring_words: u32,
    /// First chunk size of a recorded block, in words.
    pub block_min_chunk_words: u32,
    /// Chunk size cap for block growth, in words.
    pub block_max_chunk_words: u32,
    /// Spin iterations after which a wait is logged as suspicious.
    pub spin_warn_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lowpri_ring_words: 2048,
            highpri_ring_words: 512,
            block_min_chunk_words: 64,
            block_max_chunk_words: 4096,
            spin_warn_threshold: 1_000_000,
        }
    }
}

impl QueueConfig {
    /// Check sizes against the protocol limits.
    ///
    /// # Panics
    ///
    /// Panics if a ring cannot hold two maximum-size commands or the block
    /// chunk bounds are inverted.
    pub fn validate(&self) {
        let min_ring = 2 * (crate::command::MAX_COMMAND_SIZE as u32 + 1);
        assert!(
            self.lowpri_ring_words >= min_ring && self.highpri_ring_words >= min_ring,
            "ring must hold at least {min_ring} words"
        );
        assert!(
            self.block_min_chunk_words > crate::command::MAX_COMMAND_SIZE as u32
                && self.block_min_chunk_words <= self.block_max_chunk_words,
            "invalid block chunk bounds"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        QueueConfig::default().validate();
    }

    #[test]
    #[should_panic(expected = "ring must hold")]
    fn test_tiny_ring_rejected() {
        QueueConfig {
            lowpri_ring_words: 8,
            ..QueueConfig::default()
        }
        .validate();
    }
}
