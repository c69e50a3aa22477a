//! Producer-side queue context.

use std::sync::Arc;

use cpq_hal::{InterruptController, RegisterPort};
use cpq_registers::{StatusReg, WStatus, SIG_HIGHPRI_RUNNING, SIG_MORE, SIG_SYNCPOINT, SIG_USER, SP_STATUS};
use log::{debug, info};

use crate::block::BlockRecorder;
use crate::command::{internal, word0, OverlayId, MAX_COMMAND_SIZE};
use crate::config::{QueueConfig, DEFERRED_CAPACITY, DMEM_OVERLAY_TABLE, DMEM_SIZE};
use crate::dispatch::{boot, BOOT_DESCRIPTOR, BOOT_MAGIC};
use crate::memory::SharedMemory;
use crate::overlay::{OverlayImage, OverlayRegistry, Registered, StateWindow, TABLE_BYTES};
use crate::ring::Ring;
use crate::syncpoint::{reached, Deferred, Syncpoint, SyncpointState};
use crate::writer::CommandWriter;

/// Cursor mailbox layout, in words from the start of the cursor block.
const CURSOR_LOWPRI_WP: u32 = 0;
const CURSOR_LOWPRI_RP: u32 = 1;
const CURSOR_HIGHPRI_WP: u32 = 2;
const CURSOR_HIGHPRI_RP: u32 = 3;
const CURSOR_SYNCPOINT: u32 = 4;
const CURSOR_WORDS: u32 = 8;

/// Where writer calls currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// The primary ring.
    Normal,
    /// A block being recorded.
    Recording,
    /// The high-priority ring.
    HighPriority,
}

/// An unregistered overlay whose memory is released once the consumer
/// reaches `sp`. `sp` is `None` until the queue can create a syncpoint.
struct Retired {
    sp: Option<Syncpoint>,
    ovl: Registered,
}

/// The command queue: one producer context per coprocessor.
///
/// Owns the rings, the overlay registry, syncpoint state and the block
/// recorder. All producer calls go through `&mut self`.
pub struct Queue<P: RegisterPort + InterruptController> {
    pub(crate) port: P,
    pub(crate) mem: Arc<SharedMemory>,
    pub(crate) config: QueueConfig,
    initialized: bool,
    pub(crate) mode: QueueMode,
    cursors: u32,
    pub(crate) lowpri: Ring,
    pub(crate) highpri: Ring,
    pub(crate) recorder: Option<BlockRecorder>,
    registry: OverlayRegistry,
    retired: Vec<Retired>,
    pub(crate) syncpoints: SyncpointState,
    pub(crate) deferred: heapless::Deque<Deferred, DEFERRED_CAPACITY>,
}

impl<P: RegisterPort + InterruptController> Queue<P> {
    /// Create an uninitialized queue over `mem`, driving the coprocessor
    /// through `port`.
    pub fn new(port: P, mem: Arc<SharedMemory>, config: QueueConfig) -> Self {
        Self {
            port,
            mem,
            config,
            initialized: false,
            mode: QueueMode::Normal,
            cursors: 0,
            lowpri: Ring::default(),
            highpri: Ring::default(),
            recorder: None,
            registry: OverlayRegistry::default(),
            retired: Vec::new(),
            syncpoints: SyncpointState::default(),
            deferred: heapless::Deque::new(),
        }
    }

    /// Allocate the rings, publish the boot descriptor and start the
    /// consumer. Repeated calls are no-ops.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.config.validate();
        let mem = self.mem.clone();

        self.cursors = match mem.alloc(CURSOR_WORDS * 4) {
            Some(addr) => addr,
            None => panic!("out of shared memory for queue cursors"),
        };
        let cursor = |w: u32| self.cursors + 4 * w;
        self.lowpri = Ring::allocate(
            &mem,
            self.config.lowpri_ring_words,
            cursor(CURSOR_LOWPRI_WP),
            cursor(CURSOR_LOWPRI_RP),
        );
        self.highpri = Ring::allocate(
            &mem,
            self.config.highpri_ring_words,
            cursor(CURSOR_HIGHPRI_WP),
            cursor(CURSOR_HIGHPRI_RP),
        );
        self.registry = OverlayRegistry::allocate(&mem);
        let mailbox = cursor(CURSOR_SYNCPOINT);
        self.syncpoints = SyncpointState::default();
        self.port
            .set_handler(Some(self.syncpoints.interrupt_handler(mem.clone(), mailbox)));

        let generation = mem
            .read(BOOT_DESCRIPTOR + 4 * boot::GENERATION)
            .wrapping_add(1);
        let mut d = [0u32; boot::WORDS as usize];
        d[boot::GENERATION as usize] = generation;
        d[boot::LOWPRI_BASE as usize] = self.lowpri.base();
        d[boot::LOWPRI_WORDS as usize] = self.lowpri.capacity();
        d[boot::LOWPRI_WP as usize] = self.lowpri.wp_addr();
        d[boot::LOWPRI_RP as usize] = self.lowpri.rp_addr();
        d[boot::HIGHPRI_BASE as usize] = self.highpri.base();
        d[boot::HIGHPRI_WORDS as usize] = self.highpri.capacity();
        d[boot::HIGHPRI_WP as usize] = self.highpri.wp_addr();
        d[boot::HIGHPRI_RP as usize] = self.highpri.rp_addr();
        d[boot::SYNCPOINT_MAILBOX as usize] = mailbox;
        d[boot::OVERLAY_TABLE as usize] = self.registry.table_addr();
        mem.write_words(BOOT_DESCRIPTOR + 4, &d[1..]);
        mem.store_release(BOOT_DESCRIPTOR, BOOT_MAGIC);

        self.mode = QueueMode::Normal;
        self.initialized = true;
        self.port.write(
            SP_STATUS,
            WStatus::CLEAR_HALT
                | WStatus::CLEAR_BROKE
                | WStatus::CLEAR_INTR
                | WStatus::clear_sig(SIG_USER)
                | WStatus::clear_sig(SIG_HIGHPRI_RUNNING)
                | WStatus::clear_sig(SIG_SYNCPOINT)
                | WStatus::clear_sig(SIG_MORE),
        );
        info!(
            "queue initialized (generation {generation}, primary {} words at {:#x}, high-priority {} words at {:#x})",
            self.lowpri.capacity(),
            self.lowpri.base(),
            self.highpri.capacity(),
            self.highpri.base()
        );
    }

    /// Halt the consumer and release every resource. Pending commands are
    /// dropped; call [`wait`](Self::wait) first to drain them.
    pub fn close(&mut self) {
        if !self.initialized {
            return;
        }
        assert!(
            self.mode == QueueMode::Normal,
            "cannot close the queue while recording a block or in high-priority mode"
        );
        self.port.write(SP_STATUS, WStatus::SET_HALT);
        self.port.set_handler(None);
        self.mem.store_release(BOOT_DESCRIPTOR, 0);
        self.registry.release(&self.mem);
        for r in self.retired.drain(..) {
            r.ovl.release(&self.mem);
        }
        self.lowpri.release(&self.mem);
        self.highpri.release(&self.mem);
        self.mem.free(self.cursors);
        self.cursors = 0;
        self.deferred.clear();
        self.initialized = false;
        info!("queue closed");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.mem
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Producer state of the primary ring.
    pub fn lowpri_ring(&self) -> Ring {
        self.lowpri
    }

    /// Producer state of the high-priority ring.
    pub fn highpri_ring(&self) -> Ring {
        self.highpri
    }

    pub fn registry(&self) -> &OverlayRegistry {
        &self.registry
    }

    /// Reserve a `size`-word command for `cmd` of overlay id `id`.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not initialized or `size` is outside
    /// `1..=MAX_COMMAND_SIZE`. Debug builds also check that the overlay is
    /// registered and declares `cmd` with exactly `size` words.
    pub fn write_begin(&mut self, id: OverlayId, cmd: u8, size: usize) -> CommandWriter<'_, P> {
        assert!(self.initialized, "queue not initialized");
        assert!(
            (1..=MAX_COMMAND_SIZE).contains(&size),
            "command size {size} out of range 1..={MAX_COMMAND_SIZE}"
        );
        if id == OverlayId::INTERNAL {
            debug_assert_eq!(internal::size(cmd), Some(size), "bad internal command {cmd:#x}");
        } else {
            debug_assert!(
                self.registry.is_registered(id),
                "overlay id {id} is not registered"
            );
            debug_assert_eq!(
                self.registry.command_size(id.get(), cmd),
                Some(size),
                "command {cmd:#x} of overlay id {id} written with the wrong size"
            );
        }
        let addr = self.reserve(size as u32);
        CommandWriter::new(self, addr, size as u32, word0(id.opcode(cmd), 0))
    }

    /// Write a whole command: `args` follow the first word.
    pub fn write(&mut self, id: OverlayId, cmd: u8, args: &[u32]) {
        let mut w = self.write_begin(id, cmd, args.len() + 1);
        w.args(args);
        w.end();
    }

    fn reserve(&mut self, n: u32) -> u32 {
        let spin = self.config.spin_warn_threshold;
        match self.mode {
            QueueMode::Normal => self.lowpri.reserve(&self.mem, &self.port, n, spin),
            QueueMode::HighPriority => self.highpri.reserve(&self.mem, &self.port, n, spin),
            QueueMode::Recording => match self.recorder.as_mut() {
                Some(rec) => rec.reserve(&self.mem, n, &self.config),
                None => panic!("recording without a block recorder"),
            },
        }
    }

    /// Commit a reserved command whose payload is already in memory.
    pub(crate) fn commit(&mut self, addr: u32, n: u32, word0: u32) {
        self.mem.write(addr + 4 * n, 0);
        self.mem.store_release(addr, word0);
        match self.mode {
            QueueMode::Normal => {
                self.lowpri.commit(&self.mem, n);
                self.doorbell();
            }
            QueueMode::HighPriority => {
                self.highpri.commit(&self.mem, n);
                self.doorbell();
            }
            QueueMode::Recording => {
                if let Some(rec) = self.recorder.as_mut() {
                    rec.commit(n);
                }
            }
        }
    }

    /// Wake the consumer if it halted before seeing the new data.
    fn doorbell(&self) {
        self.port.write(SP_STATUS, WStatus::set_sig(SIG_MORE));
        if StatusReg::new(self.port.read(SP_STATUS)).halted() {
            self.port.write(SP_STATUS, WStatus::CLEAR_HALT);
        }
    }

    /// Make sure the consumer will process everything committed so far.
    /// No-op while recording a block.
    pub fn flush(&self) {
        if self.mode == QueueMode::Recording || !self.initialized {
            return;
        }
        self.port
            .write(SP_STATUS, WStatus::set_sig(SIG_MORE) | WStatus::CLEAR_HALT);
    }

    pub fn noop(&mut self) {
        self.write(OverlayId::INTERNAL, internal::NOOP, &[]);
    }

    /// Set or clear the user signal when the consumer reaches this point.
    ///
    /// # Panics
    ///
    /// Panics if `mask` touches anything but the user signal.
    pub fn signal(&mut self, mask: WStatus) {
        let allowed = WStatus::set_sig(SIG_USER) | WStatus::clear_sig(SIG_USER);
        assert!(
            mask.bits() & !allowed == 0,
            "only the user signal can be changed from the queue"
        );
        self.write(OverlayId::INTERNAL, internal::WRITE_STATUS, &[mask.bits()]);
    }

    /// Enqueue a copy of `len` bytes from RDRAM `rdram` to DMEM `dmem`.
    pub fn dma_to_dmem(&mut self, rdram: u32, dmem: u32, len: u32) {
        self.dma(rdram, dmem, len, 0);
    }

    /// Enqueue a copy of `len` bytes from DMEM `dmem` to RDRAM `rdram`.
    pub fn dma_to_rdram(&mut self, dmem: u32, rdram: u32, len: u32) {
        self.dma(rdram, dmem, len, internal::DMA_TO_RDRAM);
    }

    fn dma(&mut self, rdram: u32, dmem: u32, len: u32, flags: u32) {
        assert!(len > 0 && len % 4 == 0, "DMA length {len} must be a non-zero multiple of 4");
        assert!(dmem + len <= DMEM_SIZE, "DMA exceeds DMEM");
        let mut w = self.write_begin(OverlayId::INTERNAL, internal::DMA, 4);
        w.first(rdram);
        w.args(&[dmem, len - 1, flags]);
        w.end();
    }

    /// Register `image` at the first run of free ids large enough for it.
    ///
    /// # Panics
    ///
    /// Panics if no such run exists, or while recording a block.
    pub fn overlay_register(&mut self, image: OverlayImage) -> OverlayId {
        let count = image.header().id_count();
        let Some(id) = self.registry.free_run(count) else {
            panic!("no {count} consecutive free overlay ids for {}", image.name());
        };
        self.overlay_register_static(image, id);
        id
    }

    /// Register `image` at a caller-chosen id range, which must be free.
    pub fn overlay_register_static(&mut self, image: OverlayImage, id: OverlayId) {
        assert!(self.initialized, "queue not initialized");
        self.assert_not_recording();
        self.registry.load(&self.mem, image, id);
        self.update_overlay_table();
    }

    /// Unbind the overlay whose id range starts at `id`.
    ///
    /// Commands already enqueued for it still run. Its code and state memory
    /// are released once the consumer has passed the table update.
    pub fn overlay_unregister(&mut self, id: OverlayId) {
        assert!(self.initialized, "queue not initialized");
        self.assert_not_recording();
        let ovl = self.registry.remove(&self.mem, id);
        self.update_overlay_table();
        self.retired.push(Retired { sp: None, ovl });
        if self.mode == QueueMode::Normal {
            self.fence_retired();
        }
    }

    /// Host view of the persistent state of the overlay bound to `id`.
    ///
    /// On an initialized queue this waits for every enqueued command first,
    /// so the window holds the state the overlay left behind.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered, or if the queue is recording a block
    /// or in high-priority mode.
    pub fn overlay_get_state(&mut self, id: OverlayId) -> StateWindow {
        if self.initialized {
            self.wait();
        }
        self.registry.state_window(&self.mem, id)
    }

    /// Give every retired overlay without one a syncpoint after its table
    /// update.
    pub(crate) fn fence_retired(&mut self) {
        if self.retired.iter().all(|r| r.sp.is_some()) {
            return;
        }
        let sp = self.syncpoint_new();
        for r in self.retired.iter_mut().filter(|r| r.sp.is_none()) {
            r.sp = Some(sp);
        }
    }

    /// Release retired overlays the consumer can no longer reach.
    pub(crate) fn reap_retired(&mut self) {
        let done = self.syncpoints.done();
        let mem = &self.mem;
        self.retired.retain(|r| match r.sp {
            Some(sp) if reached(sp.id(), done) => {
                debug!("overlay {} memory released", r.ovl.name);
                r.ovl.release(mem);
                false
            }
            _ => true,
        });
    }

    fn assert_not_recording(&self) {
        assert!(
            self.mode != QueueMode::Recording,
            "cannot change overlays while recording a block"
        );
    }

    /// Ship the RDRAM table to the consumer ahead of any later command.
    fn update_overlay_table(&mut self) {
        let nested = self.mode == QueueMode::HighPriority;
        if !nested {
            self.highpri_begin();
        }
        self.dma_to_dmem(self.registry.table_addr(), DMEM_OVERLAY_TABLE, TABLE_BYTES);
        if !nested {
            self.highpri_end();
        }
        debug!("overlay table update enqueued");
    }
}
