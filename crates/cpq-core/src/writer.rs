//! In-place command writer.

use cpq_hal::{InterruptController, RegisterPort};

use crate::command::PAYLOAD_MASK;
use crate::queue::Queue;

/// A reserved command slot. Payload words go straight into shared memory;
/// nothing is visible to the consumer until [`end`](Self::end).
#[must_use = "a command is only committed by end()"]
pub struct CommandWriter<'q, P: RegisterPort + InterruptController> {
    queue: &'q mut Queue<P>,
    addr: u32,
    size: u32,
    word0: u32,
    next: u32,
}

impl<'q, P: RegisterPort + InterruptController> CommandWriter<'q, P> {
    pub(crate) fn new(queue: &'q mut Queue<P>, addr: u32, size: u32, word0: u32) -> Self {
        Self {
            queue,
            addr,
            size,
            word0,
            next: 1,
        }
    }

    /// Byte address of the reserved slot.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// OR an immediate into the low 24 bits of the first word.
    pub fn first(&mut self, payload: u32) -> &mut Self {
        debug_assert!(payload & !PAYLOAD_MASK == 0, "payload {payload:#x} exceeds 24 bits");
        self.word0 |= payload & PAYLOAD_MASK;
        self
    }

    /// Append one payload word.
    pub fn arg(&mut self, word: u32) -> &mut Self {
        assert!(
            self.next < self.size,
            "command overflow: more than {} words written",
            self.size
        );
        self.queue.mem.write(self.addr + 4 * self.next, word);
        self.next += 1;
        self
    }

    pub fn args(&mut self, words: &[u32]) -> &mut Self {
        for &w in words {
            self.arg(w);
        }
        self
    }

    /// Commit the command: terminator, first word, then the write cursor.
    pub fn end(self) {
        debug_assert_eq!(
            self.next, self.size,
            "command ended after {} of {} words",
            self.next, self.size
        );
        self.queue.commit(self.addr, self.size, self.word0);
    }
}
