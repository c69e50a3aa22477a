//! Syncpoint and deferred-call tests.

mod common;

use std::sync::{Arc, Mutex};

use common::Harness;
use cpq_core::dispatch::{boot, ConsumerState, Coprocessor, SimRegisters, BOOT_DESCRIPTOR};
use cpq_core::{Queue, QueueConfig, SharedMemory};
use cpq_hal::{InterruptController, InterruptHandler, RegisterPort};
use cpq_registers::{WStatus, SIG_SYNCPOINT, SP_STATUS};

/// Port that holds on to the interrupt handler so tests decide when (and
/// whether) the interrupt is delivered.
#[derive(Clone)]
struct ManualIrq {
    regs: Arc<SimRegisters>,
    handler: Arc<Mutex<Option<InterruptHandler>>>,
    enabled: bool,
}

impl ManualIrq {
    fn new(regs: Arc<SimRegisters>, enabled: bool) -> Self {
        Self {
            regs,
            handler: Arc::new(Mutex::new(None)),
            enabled,
        }
    }

    fn deliver(&self) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(&*self.regs);
        }
    }
}

impl RegisterPort for ManualIrq {
    fn read(&self, addr: u32) -> u32 {
        self.regs.read(addr)
    }

    fn write(&self, addr: u32, value: u32) {
        self.regs.write(addr, value)
    }
}

impl InterruptController for ManualIrq {
    fn set_handler(&self, handler: Option<InterruptHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn interrupts_enabled(&self) -> bool {
        self.enabled
    }
}

fn manual_setup(enabled: bool) -> (ManualIrq, Coprocessor, Queue<ManualIrq>, Arc<SharedMemory>) {
    let mem = SharedMemory::new(1 << 20);
    let regs = Arc::new(SimRegisters::new());
    let port = ManualIrq::new(regs.clone(), enabled);
    let cop = Coprocessor::new(mem.clone(), regs);
    let mut q = Queue::new(port.clone(), mem.clone(), QueueConfig::default());
    q.init();
    (port, cop, q, mem)
}

// ============================================================================
// Completion
// ============================================================================

mod completion_tests {
    use super::*;

    #[test]
    fn ids_increase_and_complete_in_order() {
        let mut h = Harness::new();
        let a = h.q.syncpoint_new();
        h.q.noop();
        let b = h.q.syncpoint_new();
        assert!(b.id() > a.id());
        assert!(!h.q.syncpoint_check(a));
        assert!(!h.q.syncpoint_check(b));

        // Step until the first is reached; the second is still ahead.
        while !h.q.syncpoint_check(a) {
            h.with_cop(|c| c.step().unwrap());
        }
        assert!(!h.q.syncpoint_check(b));

        h.run().unwrap();
        assert!(h.q.syncpoint_check(a));
        assert!(h.q.syncpoint_check(b));
    }

    #[test]
    fn wait_drives_consumer_to_syncpoint() {
        let mut h = Harness::new();
        for _ in 0..50 {
            h.q.noop();
        }
        let sp = h.q.syncpoint_new();
        h.q.syncpoint_wait(sp);
        assert!(h.q.syncpoint_check(sp));
    }

    #[test]
    fn wait_on_uninitialized_queue_returns() {
        let mem = SharedMemory::new(1 << 16);
        let regs = Arc::new(SimRegisters::new());
        let mut q = Queue::new(regs, mem, QueueConfig::default());
        q.wait();
    }

    #[test]
    #[should_panic(expected = "interrupts disabled")]
    fn wait_with_interrupts_disabled_panics() {
        let (_port, _cop, mut q, _mem) = manual_setup(false);
        let sp = q.syncpoint_new();
        q.syncpoint_wait(sp);
    }
}

// ============================================================================
// Interrupt delivery
// ============================================================================

mod interrupt_tests {
    use super::*;

    #[test]
    fn consumer_holds_next_syncpoint_until_acknowledged() {
        let (port, mut cop, mut q, _mem) = manual_setup(true);
        let a = q.syncpoint_new();
        q.noop();
        let b = q.syncpoint_new();

        // Without the handler the second syncpoint cannot be posted.
        assert_eq!(cop.run_steps(100).unwrap(), ConsumerState::Dispatching);
        assert!(!q.syncpoint_check(a));

        port.deliver();
        assert!(q.syncpoint_check(a));
        assert!(!q.syncpoint_check(b));

        cop.run_until_halted().unwrap();
        port.deliver();
        assert!(q.syncpoint_check(b));
    }

    #[test]
    fn coalesced_interrupt_completes_every_earlier_syncpoint() {
        let (port, _cop, mut q, mem) = manual_setup(true);
        let sps: Vec<_> = (0..3).map(|_| q.syncpoint_new()).collect();
        let mailbox = mem.read(BOOT_DESCRIPTOR + 4 * boot::SYNCPOINT_MAILBOX);

        // One interrupt observed for the last of three posts.
        mem.write(mailbox, sps[2].id());
        port.write(SP_STATUS, WStatus::set_sig(SIG_SYNCPOINT));
        port.deliver();
        assert!(sps.iter().all(|&sp| q.syncpoint_check(sp)));
        assert!(!port.regs.status().signal(SIG_SYNCPOINT));

        // A late, stale interrupt never moves completion backwards.
        mem.write(mailbox, sps[0].id());
        port.write(SP_STATUS, WStatus::set_sig(SIG_SYNCPOINT));
        port.deliver();
        assert!(q.syncpoint_check(sps[2]));
    }

    #[test]
    fn interrupt_without_syncpoint_signal_is_only_acknowledged() {
        let (port, _cop, mut q, _mem) = manual_setup(true);
        let sp = q.syncpoint_new();
        port.write(SP_STATUS, WStatus::SET_INTR);
        port.deliver();
        assert!(!q.syncpoint_check(sp));
        assert!(!port.regs.status().intr());
    }
}

// ============================================================================
// Deferred calls
// ============================================================================

mod deferred_tests {
    use super::*;

    #[test]
    fn callbacks_run_in_creation_order_when_polled() {
        let mut h = Harness::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            h.q.syncpoint_new_with_callback(move || order.lock().unwrap().push(i));
        }

        h.run().unwrap();
        // Reached, but callbacks only run on the producer when polled.
        assert!(order.lock().unwrap().is_empty());
        assert_eq!(h.q.pending_deferred(), 3);

        assert_eq!(h.q.poll_deferred(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(h.q.pending_deferred(), 0);
    }

    #[test]
    fn wait_runs_pending_callbacks() {
        let mut h = Harness::new();
        let ran = Arc::new(Mutex::new(0));
        let counter = ran.clone();
        h.q.syncpoint_new_with_callback(move || *counter.lock().unwrap() += 1);
        h.q.wait();
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[test]
    fn full_deferred_queue_waits_for_oldest() {
        let mut h = Harness::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..40 {
            let order = order.clone();
            h.q.syncpoint_new_with_callback(move || order.lock().unwrap().push(i));
        }
        assert!(h.q.pending_deferred() <= 32);
        assert!(!order.lock().unwrap().is_empty());

        h.q.wait();
        assert_eq!(*order.lock().unwrap(), (0..40).collect::<Vec<_>>());
    }
}
