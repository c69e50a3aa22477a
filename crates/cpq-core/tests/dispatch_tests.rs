//! Dispatch contract tests: overlay routing, halt/wake handshake and faults.

mod common;

use std::sync::Arc;

use common::{Harness, RecordingOverlay};
use cpq_core::dispatch::{ConsumerState, Coprocessor, Fault, SimRegisters};
use cpq_core::{OverlayId, Queue, QueueConfig, SharedMemory};
use cpq_hal::RegisterPort;
use cpq_registers::{WStatus, SP_STATUS};

const OVL: OverlayId = OverlayId::new(3);

fn setup(h: &mut Harness) -> RecordingOverlay {
    let ovl = RecordingOverlay::new();
    h.q.overlay_register_static(ovl.image("recorder", &[3, 1, 2]), OVL);
    h.run().unwrap();
    ovl
}

/// Step until the consumer reports `state`.
fn step_until(h: &Harness, state: ConsumerState) {
    h.with_cop(|c| {
        for _ in 0..1000 {
            if c.step().unwrap() == state {
                return;
            }
        }
        panic!("consumer never reached {state:?}");
    });
}

// ============================================================================
// Routing
// ============================================================================

mod routing_tests {
    use super::*;

    #[test]
    fn overlay_command_reaches_handler_and_advances_read_cursor() {
        let mut h = Harness::new();
        let ovl = setup(&mut h);
        let rp_before = h.q.lowpri_ring().read_offset(&h.mem);

        h.q.write(OVL, 0, &[0x10, 0x20]);
        h.run().unwrap();

        assert_eq!(ovl.records(), vec![(0, vec![0x10, 0x20], 0)]);
        let rp_after = h.q.lowpri_ring().read_offset(&h.mem);
        assert_eq!((rp_after - rp_before) * 4, 12);
    }

    #[test]
    fn opcode_0x31_runs_command_1_of_overlay_3_once() {
        let mut h = Harness::new();
        let ovl = RecordingOverlay::new();
        h.q.overlay_register_static(ovl.image("three", &[1, 3]), OverlayId::new(3));
        h.run().unwrap();
        let rp_before = h.q.lowpri_ring().read_offset(&h.mem);

        h.q.write(OverlayId::new(3), 1, &[0x10, 0x20]);
        let ring = h.q.lowpri_ring();
        assert_eq!(h.mem.read(ring.base() + 4 * rp_before) >> 24, 0x31);
        h.run().unwrap();

        assert_eq!(ovl.records(), vec![(1, vec![0x10, 0x20], 0)]);
        let rp_after = h.q.lowpri_ring().read_offset(&h.mem);
        assert_eq!((rp_after - rp_before) * 4, 12);
    }

    #[test]
    fn command_number_is_relative_to_overlay_base() {
        let mut h = Harness::new();
        let ovl = RecordingOverlay::new();
        // 20 commands span ids 6 and 7.
        let sizes = [1u8; 20];
        h.q.overlay_register_static(ovl.image("wide", &sizes), OverlayId::new(6));
        h.q.write(OverlayId::new(7), 2, &[]);
        h.q.write(OverlayId::new(6), 15, &[]);
        h.run().unwrap();

        let commands: Vec<u16> = ovl.records().iter().map(|r| r.0).collect();
        assert_eq!(commands, vec![18, 15]);
    }

    #[test]
    fn internal_commands_do_not_reach_overlays() {
        let mut h = Harness::new();
        let ovl = setup(&mut h);
        h.q.noop();
        h.q.noop();
        h.q.write(OVL, 1, &[]);
        h.run().unwrap();

        assert_eq!(ovl.records().len(), 1);
        assert!(h.with_cop(|c| c.stats().internal) >= 2);
    }

    #[test]
    fn signal_sets_user_bit() {
        use cpq_registers::{WStatus, SIG_USER};

        let mut h = Harness::new();
        h.q.signal(WStatus::new(WStatus::set_sig(SIG_USER)));
        h.run().unwrap();
        assert!(h.regs.status().signal(SIG_USER));
    }

    #[test]
    #[should_panic(expected = "only the user signal")]
    fn signal_rejects_reserved_bits() {
        use cpq_registers::{WStatus, SIG_MORE};

        let mut h = Harness::new();
        h.q.signal(WStatus::new(WStatus::set_sig(SIG_MORE)));
    }

    #[test]
    fn dma_round_trips_through_dmem() {
        let mut h = Harness::new();
        let src = h.mem.alloc(16).unwrap();
        let dst = h.mem.alloc(16).unwrap();
        h.mem.write_words(src, &[1, 2, 3, 4]);

        h.q.dma_to_dmem(src, 0x800, 16);
        h.q.dma_to_rdram(0x800, dst, 16);
        h.run().unwrap();

        let mut out = [0u32; 4];
        h.mem.read_words(dst, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(h.with_cop(|c| c.dmem_word(0x804)), 2);
    }
}

// ============================================================================
// Halt / wake handshake
// ============================================================================

mod wakeup_tests {
    use super::*;

    #[test]
    fn commit_between_empty_check_and_halt_is_not_lost() {
        let mut h = Harness::new();
        let ovl = setup(&mut h);

        h.q.write(OVL, 1, &[]);
        // The consumer has seen the ring empty but not halted yet.
        step_until(&h, ConsumerState::Halting);

        h.q.write(OVL, 0, &[7, 8]);
        let next = h.with_cop(|c| c.step().unwrap());
        assert_eq!(next, ConsumerState::Running);

        h.run().unwrap();
        assert_eq!(ovl.records().len(), 2);
        assert_eq!(ovl.records()[1].1, vec![7, 8]);
    }

    #[test]
    fn commit_after_halt_wakes_consumer() {
        let mut h = Harness::new();
        let ovl = setup(&mut h);
        assert!(h.regs.status().halted());
        let wakeups = h.with_cop(|c| c.stats().wakeups);

        h.q.write(OVL, 1, &[]);
        assert!(!h.regs.status().halted());
        h.run().unwrap();

        assert_eq!(ovl.records().len(), 1);
        assert_eq!(h.with_cop(|c| c.stats().wakeups), wakeups + 1);
    }

    #[test]
    fn reserved_but_uncommitted_command_is_picked_up_after_commit() {
        let mut h = Harness::new();
        let ovl = setup(&mut h);
        h.q.write(OVL, 1, &[]);
        step_until(&h, ConsumerState::Halted);

        {
            let mut w = h.q.write_begin(OVL, 2, 2);
            w.arg(99);
            // Not committed: a consumer woken now must not run it.
            h.regs.write(SP_STATUS, WStatus::CLEAR_HALT);
            h.cop.lock().unwrap().run_until_halted().unwrap();
            assert_eq!(ovl.records().len(), 1);
            w.end();
        }
        h.run().unwrap();
        assert_eq!(ovl.records().len(), 2);
        assert_eq!(ovl.records()[1].1, vec![99]);
    }

    #[test]
    fn idle_consumer_stays_halted() {
        let mut h = Harness::new();
        setup(&mut h);
        let halts = h.with_cop(|c| c.stats().halts);
        for _ in 0..10 {
            assert_eq!(h.with_cop(|c| c.step().unwrap()), ConsumerState::Halted);
        }
        assert_eq!(h.with_cop(|c| c.stats().halts), halts);
    }
}

// ============================================================================
// Faults
// ============================================================================

mod fault_tests {
    use super::*;

    #[test]
    fn unregistered_overlay_faults_consumer() {
        let mut h = Harness::new();
        let _ovl = setup(&mut h);

        h.q.block_begin();
        h.q.write(OVL, 0, &[1, 2]);
        let block = h.q.block_end();
        h.q.overlay_unregister(OVL);
        h.q.block_run(&block);

        let err = h.run().unwrap_err();
        assert!(matches!(err, Fault::UnregisteredOverlay { id: 3, .. }));
        assert!(h.regs.status().broke());
        assert!(h.regs.status().halted());
        // Terminal: later steps report the same fault.
        assert_eq!(h.with_cop(|c| c.step()), Err(err));
    }

    #[test]
    #[should_panic(expected = "DMEM offset 0x1000 out of range")]
    fn dmem_read_past_end_panics() {
        let cop = Coprocessor::new(SharedMemory::new(1 << 16), Arc::new(SimRegisters::new()));
        assert_eq!(cop.dmem_word(0xFFC), 0);
        cop.dmem_word(0x1000);
    }

    #[test]
    fn consumer_without_descriptor_faults_on_boot() {
        let mem = SharedMemory::new(1 << 16);
        let regs = Arc::new(SimRegisters::new());
        let mut cop = Coprocessor::new(mem, regs.clone());
        regs.write(SP_STATUS, WStatus::CLEAR_HALT);
        assert_eq!(cop.step(), Err(Fault::BadBootDescriptor(0)));
    }
}

// ============================================================================
// Threaded consumer
// ============================================================================

mod thread_tests {
    use super::*;

    #[test]
    fn consumer_thread_drains_queue() {
        let mem = SharedMemory::new(1 << 20);
        let regs = Arc::new(SimRegisters::new());
        let consumer = Coprocessor::new(mem.clone(), regs.clone()).spawn();

        let config = QueueConfig {
            lowpri_ring_words: 256,
            ..QueueConfig::default()
        };
        let mut q = Queue::new(regs.clone(), mem.clone(), config);
        q.init();
        let ovl = RecordingOverlay::new();
        q.overlay_register_static(ovl.image("recorder", &[3, 1, 2]), OVL);

        for i in 0..2000u32 {
            q.write(OVL, 0, &[i, i ^ 0xFFFF]);
        }
        q.wait();

        let tags = ovl.tags();
        assert_eq!(tags, (0..2000).collect::<Vec<_>>());

        let (cop, result) = consumer.join();
        assert!(result.is_ok());
        assert!(cop.stats().commands >= 2000);
        q.close();
    }
}
