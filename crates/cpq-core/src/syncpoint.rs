//! Syncpoints and deferred calls.
//!
//! A syncpoint is a SYNCPOINT command carrying its own id. When the consumer
//! reaches it, it stores the id in a mailbox and raises the CPU interrupt; the
//! handler moves the completion counter up to that id. Storing the id instead
//! of counting interrupts keeps the counter right when interrupts coalesce.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cpq_hal::{InterruptController, InterruptHandler, RegisterPort};
use cpq_registers::{StatusReg, WStatus, SIG_SYNCPOINT, SP_STATUS};
use log::warn;

use crate::command::{internal, OverlayId};
use crate::memory::SharedMemory;
use crate::queue::{Queue, QueueMode};

/// A completion token: reached once the consumer has dispatched every command
/// enqueued before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Syncpoint(u32);

impl Syncpoint {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// `id` is reached once `done` has caught up with it. Ids wrap, so compare
/// through the signed distance.
#[inline]
pub(crate) const fn reached(id: u32, done: u32) -> bool {
    (id.wrapping_sub(done) as i32) <= 0
}

pub(crate) struct SyncpointState {
    next: u32,
    done: Arc<AtomicU32>,
}

impl Default for SyncpointState {
    fn default() -> Self {
        Self {
            next: 1,
            done: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl SyncpointState {
    /// Interrupt handler that publishes the mailbox id into the completion
    /// counter and acknowledges the interrupt.
    pub(crate) fn interrupt_handler(&self, mem: Arc<SharedMemory>, mailbox: u32) -> InterruptHandler {
        let done = self.done.clone();
        Box::new(move |port: &dyn RegisterPort| {
            let status = StatusReg::new(port.read(SP_STATUS));
            if status.signal(SIG_SYNCPOINT) {
                let id = mem.load_acquire(mailbox);
                // Never move backwards, even if an old id is seen late.
                let _ = done.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    (!reached(id, cur)).then_some(id)
                });
                port.write(
                    SP_STATUS,
                    WStatus::CLEAR_INTR | WStatus::clear_sig(SIG_SYNCPOINT),
                );
            } else {
                port.write(SP_STATUS, WStatus::CLEAR_INTR);
            }
        })
    }

    pub(crate) fn done(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }
}

/// A callback waiting for its syncpoint.
pub(crate) struct Deferred {
    sp: Syncpoint,
    func: Box<dyn FnOnce() + Send>,
}

impl<P: RegisterPort + InterruptController> Queue<P> {
    /// Enqueue a new syncpoint.
    ///
    /// # Panics
    ///
    /// Panics while recording a block or in high-priority mode.
    pub fn syncpoint_new(&mut self) -> Syncpoint {
        assert!(
            self.mode != QueueMode::Recording,
            "cannot create a syncpoint while recording a block"
        );
        assert!(
            self.mode != QueueMode::HighPriority,
            "cannot create a syncpoint in high-priority mode"
        );
        let id = self.syncpoints.next;
        self.syncpoints.next = id.wrapping_add(1);
        self.write(
            OverlayId::INTERNAL,
            internal::SYNCPOINT,
            &[id, WStatus::SET_INTR | WStatus::set_sig(SIG_SYNCPOINT)],
        );
        Syncpoint(id)
    }

    /// Enqueue a syncpoint and run `func` on this thread the first time the
    /// queue is polled after the consumer reaches it. Callbacks run in
    /// creation order.
    pub fn syncpoint_new_with_callback(&mut self, func: impl FnOnce() + Send + 'static) -> Syncpoint {
        if self.deferred.is_full() {
            if let Some(oldest) = self.deferred.front().map(|d| d.sp) {
                self.syncpoint_wait(oldest);
            }
        }
        let sp = self.syncpoint_new();
        let pushed = self.deferred.push_back(Deferred {
            sp,
            func: Box::new(func),
        });
        assert!(pushed.is_ok(), "deferred call queue overflow");
        sp
    }

    /// Non-blocking: has the consumer reached `sp`?
    pub fn syncpoint_check(&self, sp: Syncpoint) -> bool {
        reached(sp.0, self.syncpoints.done())
    }

    /// Block until the consumer reaches `sp`, running due callbacks while
    /// waiting.
    ///
    /// # Panics
    ///
    /// Panics if coprocessor interrupts cannot be delivered.
    pub fn syncpoint_wait(&mut self, sp: Syncpoint) {
        if self.syncpoint_check(sp) {
            return;
        }
        assert!(
            self.port.interrupts_enabled(),
            "syncpoint wait with coprocessor interrupts disabled would never return"
        );
        self.flush();
        let mut spins = 0u32;
        loop {
            self.poll_deferred();
            if self.syncpoint_check(sp) {
                break;
            }
            spins += 1;
            if spins == self.config.spin_warn_threshold {
                warn!(
                    "still waiting for syncpoint {} (done {}) after {spins} spins",
                    sp.0,
                    self.syncpoints.done()
                );
            }
            self.port.idle();
        }
        self.poll_deferred();
    }

    /// Run every deferred callback whose syncpoint has been reached, oldest
    /// first. Returns how many ran.
    pub fn poll_deferred(&mut self) -> usize {
        self.reap_retired();
        let mut ran = 0;
        while let Some(sp) = self.deferred.front().map(|d| d.sp) {
            if !self.syncpoint_check(sp) {
                break;
            }
            if let Some(d) = self.deferred.pop_front() {
                (d.func)();
                ran += 1;
            }
        }
        ran
    }

    /// Deferred callbacks not yet run.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Wait for every command enqueued so far to be dispatched.
    pub fn wait(&mut self) {
        assert!(
            self.mode == QueueMode::Normal,
            "wait() is only allowed outside blocks and high-priority mode"
        );
        if !self.is_initialized() {
            return;
        }
        let sp = self.syncpoint_new();
        self.syncpoint_wait(sp);
    }
}
