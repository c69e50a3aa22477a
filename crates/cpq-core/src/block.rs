//! Recorded command blocks.
//!
//! While recording, writer calls append to a chain of chunks in shared memory
//! instead of the ring. Chunks start small and double up to a cap; each full
//! chunk ends in a JUMP to the next. The block ends in a RET through the call
//! slot matching its nesting level, so a block that calls other blocks never
//! clobbers their return addresses.
//!
//! Blocks are not reference counted. Freeing a block that a live block or a
//! not-yet-executed CALL still targets is a caller error; debug builds poison
//! freed memory so the consumer faults instead of running stale commands.

use cpq_hal::{InterruptController, RegisterPort};
use log::debug;

use crate::command::{internal, OverlayId};
use crate::config::{QueueConfig, MAX_BLOCK_NESTING};
use crate::memory::SharedMemory;
use crate::queue::{Queue, QueueMode};

/// A finished block. Owned by its creator until passed to
/// [`Queue::block_free`].
#[derive(Debug)]
pub struct Block {
    chunks: Vec<u32>,
    words: u32,
    nesting_level: u32,
    pub(crate) rdp_tracking: Option<u32>,
}

impl Block {
    /// Address of the first command.
    pub fn addr(&self) -> u32 {
        self.chunks[0]
    }

    /// Call depth below this block: 0 for a block that runs no other block.
    pub fn nesting_level(&self) -> u32 {
        self.nesting_level
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Words of recorded commands, excluding chunk links and the final RET.
    pub fn len_words(&self) -> u32 {
        self.words
    }

    /// Rasterizer hazard state at the end of the block, if it contains
    /// rasterizer commands.
    pub fn rdp_tracking(&self) -> Option<u32> {
        self.rdp_tracking
    }
}

pub(crate) struct BlockRecorder {
    block: Block,
    chunk: u32,
    chunk_words: u32,
    wp: u32,
}

impl BlockRecorder {
    fn start(mem: &SharedMemory, config: &QueueConfig) -> Self {
        let words = config.block_min_chunk_words;
        let chunk = alloc_chunk(mem, words);
        Self {
            block: Block {
                chunks: vec![chunk],
                words: 0,
                nesting_level: 0,
                rdp_tracking: None,
            },
            chunk,
            chunk_words: words,
            wp: 0,
        }
    }

    /// Reserve `n` words, chaining a new chunk if the current one cannot hold
    /// them plus the trailing JUMP or RET.
    pub(crate) fn reserve(&mut self, mem: &SharedMemory, n: u32, config: &QueueConfig) -> u32 {
        if self.wp + n >= self.chunk_words {
            let words = (self.chunk_words * 2).min(config.block_max_chunk_words);
            let next = alloc_chunk(mem, words);
            mem.write(self.chunk + 4 * self.wp, internal::jump(next));
            debug!(
                "block chunk {} grown: {words} words at {next:#x}",
                self.block.chunks.len()
            );
            self.block.chunks.push(next);
            self.chunk = next;
            self.chunk_words = words;
            self.wp = 0;
        }
        self.chunk + 4 * self.wp
    }

    pub(crate) fn commit(&mut self, n: u32) {
        self.wp += n;
        self.block.words += n;
    }

    fn finish(self, mem: &SharedMemory) -> Block {
        mem.write(
            self.chunk + 4 * self.wp,
            internal::ret(self.block.nesting_level),
        );
        self.block
    }
}

fn alloc_chunk(mem: &SharedMemory, words: u32) -> u32 {
    match mem.alloc(words * 4) {
        Some(addr) => addr,
        None => panic!("out of shared memory for a {words}-word block chunk"),
    }
}

impl<P: RegisterPort + InterruptController> Queue<P> {
    /// Start recording a block. Writer calls go to the block until
    /// [`block_end`](Self::block_end).
    ///
    /// # Panics
    ///
    /// Panics if a block is already being recorded or the queue is in
    /// high-priority mode.
    pub fn block_begin(&mut self) {
        assert!(self.is_initialized(), "queue not initialized");
        assert!(
            self.mode != QueueMode::Recording,
            "a block is already being recorded"
        );
        assert!(
            self.mode != QueueMode::HighPriority,
            "cannot record a block in high-priority mode"
        );
        self.recorder = Some(BlockRecorder::start(&self.mem, &self.config));
        self.mode = QueueMode::Recording;
    }

    /// Finish recording and return the block.
    pub fn block_end(&mut self) -> Block {
        assert!(
            self.mode == QueueMode::Recording,
            "no block is being recorded"
        );
        let Some(rec) = self.recorder.take() else {
            panic!("no block is being recorded");
        };
        self.mode = QueueMode::Normal;
        let block = rec.finish(&self.mem);
        debug!(
            "block recorded at {:#x}: {} words, {} chunks, nesting {}",
            block.addr(),
            block.words,
            block.chunks.len(),
            block.nesting_level
        );
        block
    }

    /// Enqueue a call to `block` on the current target: the primary ring or
    /// the block being recorded.
    ///
    /// # Panics
    ///
    /// Panics in high-priority mode, or if recording this call would nest
    /// blocks deeper than [`MAX_BLOCK_NESTING`].
    pub fn block_run(&mut self, block: &Block) {
        assert!(
            self.mode != QueueMode::HighPriority,
            "blocks cannot be run from the high-priority queue"
        );
        if let Some(rec) = self.recorder.as_mut() {
            let level = rec.block.nesting_level.max(block.nesting_level + 1);
            assert!(
                level < MAX_BLOCK_NESTING,
                "block nesting level {level} exceeds the maximum of {}",
                MAX_BLOCK_NESTING - 1
            );
            rec.block.nesting_level = level;
        }
        let mut w = self.write_begin(OverlayId::INTERNAL, internal::CALL, 2);
        w.first(block.addr());
        w.arg(block.nesting_level << 2);
        w.end();
    }

    /// Release a block's memory.
    pub fn block_free(&mut self, block: Block) {
        for chunk in block.chunks {
            self.mem.free(chunk);
        }
    }
}
