//! Dispatch state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpq_hal::RegisterPort;
use cpq_registers::{StatusReg, WStatus, SIG_MORE, SIG_SYNCPOINT, SP_STATUS};
use log::{debug, error, info, trace};

use super::{boot, CommandContext, Fault, OverlayCode, SimRegisters, BOOT_DESCRIPTOR, BOOT_MAGIC};
use crate::command::{decode, internal, COMMANDS_PER_ID, MAX_COMMAND_SIZE, PAYLOAD_MASK};
use crate::config::{DMEM_OVERLAY_TABLE, DMEM_SIZE, DMEM_STATE_WINDOW, MAX_BLOCK_NESTING};
use crate::memory::SharedMemory;
use crate::overlay::{OverlayHeader, TABLE_BYTES, TABLE_ENTRY_WORDS};

/// Run state of the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not executing; waits for HALTED to be cleared.
    Halted,
    /// Ready to fetch the next command.
    Running,
    /// A command has been fetched and is about to execute.
    Dispatching,
    /// Found the ring empty; halts on the next step unless a doorbell
    /// arrived in between.
    Halting,
    /// Stopped on a divergence. Terminal.
    Faulted(Fault),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub commands: u64,
    pub internal: u64,
    pub overlay_switches: u64,
    pub halts: u64,
    pub wakeups: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RingInfo {
    base: u32,
    words: u32,
    wp_addr: u32,
    rp_addr: u32,
}

impl RingInfo {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + self.words * 4
    }

    fn offset(&self, addr: u32) -> u32 {
        (addr - self.base) / 4
    }
}

#[derive(Debug, Clone, Copy)]
struct BootInfo {
    generation: u32,
    rings: [RingInfo; 2],
    syncpoint_mailbox: u32,
}

struct Resident {
    code_addr: u32,
    header_addr: u32,
    state_addr: u32,
    state_size: u32,
    base: u8,
    command_sizes: Vec<u8>,
    code: Arc<dyn OverlayCode>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Internal(u8),
    Overlay(u16),
}

struct Pending {
    addr: u32,
    target: Target,
    words: heapless::Vec<u32, MAX_COMMAND_SIZE>,
}

/// Host simulation of the dispatch firmware.
pub struct Coprocessor {
    mem: Arc<SharedMemory>,
    regs: Arc<SimRegisters>,
    state: ConsumerState,
    boot: Option<BootInfo>,
    dmem: Vec<u32>,
    ptr: u32,
    current: usize,
    saved: [u32; 2],
    call_slots: [u32; MAX_BLOCK_NESTING as usize],
    resident: Option<Resident>,
    pending: Option<Pending>,
    stats: ConsumerStats,
}

impl Coprocessor {
    /// A powered-on but halted coprocessor. It boots from the descriptor at
    /// [`BOOT_DESCRIPTOR`] the first time HALTED is cleared.
    pub fn new(mem: Arc<SharedMemory>, regs: Arc<SimRegisters>) -> Self {
        Self {
            mem,
            regs,
            state: ConsumerState::Halted,
            boot: None,
            dmem: vec![0; (DMEM_SIZE / 4) as usize],
            ptr: 0,
            current: 0,
            saved: [0; 2],
            call_slots: [0; MAX_BLOCK_NESTING as usize],
            resident: None,
            pending: None,
            stats: ConsumerStats::default(),
        }
    }

    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Current fetch address.
    pub fn fetch_addr(&self) -> u32 {
        self.ptr
    }

    /// Index of the ring being read: 0 primary, 1 high-priority.
    pub fn current_queue(&self) -> usize {
        self.current
    }

    /// Read a DMEM word at byte offset `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of DMEM.
    pub fn dmem_word(&self, offset: u32) -> u32 {
        assert!(offset < DMEM_SIZE, "DMEM offset {offset:#x} out of range");
        self.dmem[(offset / 4) as usize]
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self) -> Result<ConsumerState, Fault> {
        let next = match self.state {
            ConsumerState::Faulted(ref f) => return Err(f.clone()),
            ConsumerState::Halted => self.resume(),
            ConsumerState::Running => self.fetch(),
            ConsumerState::Dispatching => self.dispatch(),
            ConsumerState::Halting => Ok(self.halt()),
        };
        match next {
            Ok(state) => {
                self.state = state.clone();
                Ok(state)
            }
            Err(fault) => {
                error!("coprocessor fault at {:#x}: {fault}", self.ptr);
                self.regs.raise(StatusReg::BROKE | StatusReg::HALTED);
                self.state = ConsumerState::Faulted(fault.clone());
                Err(fault)
            }
        }
    }

    /// Step until the consumer halts.
    pub fn run_until_halted(&mut self) -> Result<(), Fault> {
        loop {
            if self.step()? == ConsumerState::Halted {
                return Ok(());
            }
        }
    }

    /// Step at most `max` times; returns the state reached.
    pub fn run_steps(&mut self, max: usize) -> Result<ConsumerState, Fault> {
        for _ in 0..max {
            if self.step()? == ConsumerState::Halted {
                break;
            }
        }
        Ok(self.state.clone())
    }

    /// Run the consumer on its own thread until [`ConsumerThread::join`].
    pub fn spawn(mut self) -> ConsumerThread {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                match self.step() {
                    Ok(ConsumerState::Halted) => std::thread::yield_now(),
                    Ok(_) => {}
                    Err(fault) => return (self, Err(fault)),
                }
            }
            (self, Ok(()))
        });
        ConsumerThread { stop, handle }
    }

    fn resume(&mut self) -> Result<ConsumerState, Fault> {
        if self.regs.status().halted() {
            return Ok(ConsumerState::Halted);
        }
        self.regs.write(SP_STATUS, WStatus::clear_sig(SIG_MORE));
        self.stats.wakeups += 1;
        let generation = self.mem.load_acquire(BOOT_DESCRIPTOR + 4 * boot::GENERATION);
        if self.boot.map(|b| b.generation) != Some(generation) {
            self.boot_from_descriptor()?;
        }
        Ok(ConsumerState::Running)
    }

    fn boot_from_descriptor(&mut self) -> Result<(), Fault> {
        let mut d = [0u32; boot::WORDS as usize];
        self.mem.read_words(BOOT_DESCRIPTOR, &mut d);
        if d[boot::MAGIC as usize] != BOOT_MAGIC {
            return Err(Fault::BadBootDescriptor(d[boot::MAGIC as usize]));
        }
        let ring = |base: u32, words: u32, wp: u32, rp: u32| RingInfo {
            base: d[base as usize],
            words: d[words as usize],
            wp_addr: d[wp as usize],
            rp_addr: d[rp as usize],
        };
        let info = BootInfo {
            generation: d[boot::GENERATION as usize],
            rings: [
                ring(boot::LOWPRI_BASE, boot::LOWPRI_WORDS, boot::LOWPRI_WP, boot::LOWPRI_RP),
                ring(boot::HIGHPRI_BASE, boot::HIGHPRI_WORDS, boot::HIGHPRI_WP, boot::HIGHPRI_RP),
            ],
            syncpoint_mailbox: d[boot::SYNCPOINT_MAILBOX as usize],
        };
        self.dmem.fill(0);
        self.dma(d[boot::OVERLAY_TABLE as usize], DMEM_OVERLAY_TABLE, TABLE_BYTES, false)?;
        self.saved = [info.rings[0].base, info.rings[1].base];
        self.ptr = info.rings[0].base;
        self.current = 0;
        self.call_slots = [0; MAX_BLOCK_NESTING as usize];
        self.resident = None;
        self.pending = None;
        self.boot = Some(info);
        info!(
            "coprocessor booted (generation {}, primary ring {:#x}, high-priority ring {:#x})",
            info.generation, info.rings[0].base, info.rings[1].base
        );
        Ok(())
    }

    fn halt(&mut self) -> ConsumerState {
        if self.regs.try_halt() {
            self.stats.halts += 1;
            trace!("coprocessor halted at {:#x}", self.ptr);
            ConsumerState::Halted
        } else {
            ConsumerState::Running
        }
    }

    fn ring(&self, index: usize) -> RingInfo {
        self.boot.map(|b| b.rings[index]).unwrap_or_default()
    }

    fn fetch(&mut self) -> Result<ConsumerState, Fault> {
        if self.regs.status().halted() {
            return Ok(ConsumerState::Halted);
        }
        let ring = self.ring(self.current);
        let in_ring = ring.contains(self.ptr);
        if in_ring && ring.offset(self.ptr) == self.mem.load_acquire(ring.wp_addr) {
            return Ok(ConsumerState::Halting);
        }
        if !self.mem.contains(self.ptr, 4) {
            return Err(Fault::FetchOutOfRange { addr: self.ptr });
        }
        let w0 = self.mem.load_acquire(self.ptr);
        if w0 == 0 {
            // Terminator: the producer has not committed this slot yet.
            if in_ring {
                return Ok(ConsumerState::Halting);
            }
            return Err(Fault::InvalidOpcode {
                addr: self.ptr,
                word: w0,
            });
        }
        let (id, cmd) = decode(w0);
        let (size, target) = if id == 0 {
            let size = internal::size(cmd).ok_or(Fault::InvalidOpcode {
                addr: self.ptr,
                word: w0,
            })?;
            (size, Target::Internal(cmd))
        } else {
            let addr = self.ptr;
            let resident = self.select_overlay(id)?;
            let index = (id - resident.base) as usize * COMMANDS_PER_ID + cmd as usize;
            let size = resident
                .command_sizes
                .get(index)
                .copied()
                .ok_or(Fault::UnknownCommand {
                    addr,
                    id,
                    command: index as u16,
                })?;
            (size as usize, Target::Overlay(index as u16))
        };
        if !self.mem.contains(self.ptr, size as u32 * 4) {
            return Err(Fault::FetchOutOfRange { addr: self.ptr });
        }
        let mut words = heapless::Vec::new();
        for i in 0..size as u32 {
            // size is bounded by MAX_COMMAND_SIZE, so the push cannot fail.
            let _ = words.push(self.mem.read(self.ptr + 4 * i));
        }
        trace!("fetch {:#x}: opcode {:#04x}, {size} words", self.ptr, w0 >> 24);
        self.pending = Some(Pending {
            addr: self.ptr,
            target,
            words,
        });
        Ok(ConsumerState::Dispatching)
    }

    /// Make the overlay bound to `id` resident, swapping state windows.
    fn select_overlay(&mut self, id: u8) -> Result<&Resident, Fault> {
        let entry = DMEM_OVERLAY_TABLE + id as u32 * TABLE_ENTRY_WORDS * 4;
        let code_addr = self.dmem_word(entry);
        let header_addr = self.dmem_word(entry + 4);
        let state_addr = self.dmem_word(entry + 8);
        let base = (self.dmem_word(entry + 12) & 0xFF) as u8;
        let fault = Fault::UnregisteredOverlay { addr: self.ptr, id };
        if code_addr == 0 {
            return Err(fault);
        }
        if self.resident.as_ref().map(|r| r.header_addr) != Some(header_addr) {
            let code = self.mem.code_at(code_addr).ok_or(fault)?;
            let header = self.read_header(header_addr)?;
            self.save_state();
            let words = header.state_size / 4;
            let window = (DMEM_STATE_WINDOW / 4) as usize;
            self.mem
                .read_words(state_addr, &mut self.dmem[window..window + words as usize]);
            debug!("overlay at id {id:#x} switched in ({} state bytes)", header.state_size);
            self.stats.overlay_switches += 1;
            self.resident = Some(Resident {
                code_addr,
                header_addr,
                state_addr,
                state_size: header.state_size,
                base,
                command_sizes: header.command_sizes,
                code,
            });
        }
        self.resident.as_ref().ok_or(Fault::UnregisteredOverlay { addr: self.ptr, id })
    }

    fn read_header(&self, addr: u32) -> Result<OverlayHeader, Fault> {
        let bad = Fault::BadOverlayHeader { header: addr };
        if !self.mem.contains(addr, 8) {
            return Err(bad);
        }
        let count = self.mem.read(addr + 4) & 0xFFFF;
        if !self.mem.contains(addr, (2 + count) * 4) {
            return Err(bad);
        }
        let mut words = vec![0; 2 + count as usize];
        self.mem.read_words(addr, &mut words);
        OverlayHeader::parse(&words).map_err(|_| bad)
    }

    fn save_state(&mut self) {
        if let Some(r) = &self.resident {
            let window = (DMEM_STATE_WINDOW / 4) as usize;
            let words = (r.state_size / 4) as usize;
            self.mem
                .write_words(r.state_addr, &self.dmem[window..window + words]);
        }
    }

    /// Forget the resident overlay if a table reload unbound it. Its state
    /// memory is released by the producer after this point, so it is not
    /// saved.
    fn check_resident(&mut self) {
        let Some(r) = &self.resident else {
            return;
        };
        let entry = DMEM_OVERLAY_TABLE + r.base as u32 * TABLE_ENTRY_WORDS * 4;
        if self.dmem_word(entry) != r.code_addr || self.dmem_word(entry + 4) != r.header_addr {
            debug!("resident overlay at id {:#x} unbound", r.base);
            self.resident = None;
        }
    }

    fn dispatch(&mut self) -> Result<ConsumerState, Fault> {
        let Some(cmd) = self.pending.take() else {
            return Ok(ConsumerState::Running);
        };
        let next = cmd.addr + 4 * cmd.words.len() as u32;
        match cmd.target {
            Target::Internal(id) => {
                if !self.execute_internal(id, &cmd.words, next)? {
                    // Retry the same command on the next step.
                    self.pending = Some(cmd);
                    return Ok(ConsumerState::Dispatching);
                }
                self.stats.internal += 1;
            }
            Target::Overlay(index) => {
                let Some(resident) = &self.resident else {
                    return Err(Fault::UnregisteredOverlay {
                        addr: cmd.addr,
                        id: (cmd.words[0] >> 28) as u8,
                    });
                };
                let code = resident.code.clone();
                let window = (DMEM_STATE_WINDOW / 4) as usize;
                let words = (resident.state_size / 4) as usize;
                let mut ctx = CommandContext::new(
                    &mut self.dmem[window..window + words],
                    &self.mem,
                    &self.regs,
                );
                code.execute(&mut ctx, index, &cmd.words)?;
                self.ptr = next;
            }
        }
        self.stats.commands += 1;
        self.publish_read(self.current, self.ptr);
        Ok(ConsumerState::Running)
    }

    /// Returns false if the command must be retried.
    fn execute_internal(&mut self, id: u8, words: &[u32], next: u32) -> Result<bool, Fault> {
        let payload = words[0] & PAYLOAD_MASK;
        let here = next - 4 * words.len() as u32;
        match id {
            internal::NOOP => self.ptr = next,
            internal::JUMP => self.ptr = payload,
            internal::CALL => {
                let slot = words[1] >> 2;
                let saved = self
                    .call_slots
                    .get_mut(slot as usize)
                    .ok_or(Fault::BadCallSlot { addr: here, slot })?;
                *saved = next;
                self.ptr = payload;
            }
            internal::RET => {
                let slot = payload >> 2;
                self.ptr = *self
                    .call_slots
                    .get(slot as usize)
                    .ok_or(Fault::BadCallSlot { addr: here, slot })?;
            }
            internal::DMA => {
                let to_rdram = words[3] & internal::DMA_TO_RDRAM != 0;
                let (dmem, len) = (words[1], words[2] + 1);
                self.dma(payload, dmem, len, to_rdram)?;
                if !to_rdram && dmem < DMEM_OVERLAY_TABLE + TABLE_BYTES && dmem + len > DMEM_OVERLAY_TABLE {
                    self.check_resident();
                }
                self.ptr = next;
            }
            internal::WRITE_STATUS => {
                self.regs.write(SP_STATUS, words[1]);
                self.ptr = next;
            }
            internal::SWAP_BUFFERS => {
                let (to, from) = (payload as usize, words[1] as usize);
                if to > 1 || from > 1 {
                    return Err(Fault::BadQueueIndex {
                        addr: here,
                        index: payload.max(words[1]),
                    });
                }
                self.saved[from] = next;
                self.publish_read(from, next);
                self.current = to;
                self.ptr = self.saved[to];
                trace!("swap to queue {to} at {:#x}", self.ptr);
                self.regs.write(SP_STATUS, words[2]);
            }
            internal::SYNCPOINT => {
                // The previous syncpoint interrupt has not been acknowledged.
                if self.regs.status().signal(SIG_SYNCPOINT) {
                    return Ok(false);
                }
                // Everything before the syncpoint is complete, overlay state
                // included.
                self.save_state();
                if let Some(b) = self.boot {
                    self.mem.store_release(b.syncpoint_mailbox, words[1]);
                }
                self.regs.write(SP_STATUS, words[2]);
                self.ptr = next;
            }
            _ => {
                return Err(Fault::InvalidOpcode {
                    addr: here,
                    word: words[0],
                })
            }
        }
        Ok(true)
    }

    fn dma(&mut self, rdram: u32, dmem: u32, len: u32, to_rdram: bool) -> Result<(), Fault> {
        let bad = Fault::DmaOutOfRange { rdram, dmem, len };
        if len % 4 != 0 || dmem % 4 != 0 || dmem + len > DMEM_SIZE || !self.mem.contains(rdram, len) {
            return Err(bad);
        }
        let range = (dmem / 4) as usize..((dmem + len) / 4) as usize;
        if to_rdram {
            self.mem.write_words(rdram, &self.dmem[range]);
        } else {
            self.mem.read_words(rdram, &mut self.dmem[range]);
        }
        Ok(())
    }

    fn publish_read(&self, queue: usize, addr: u32) {
        let ring = self.ring(queue);
        if ring.contains(addr) {
            self.mem.store_release(ring.rp_addr, ring.offset(addr));
        }
    }
}

/// Handle to a consumer running on its own thread.
pub struct ConsumerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<(Coprocessor, Result<(), Fault>)>,
}

impl ConsumerThread {
    /// True once the thread has exited, which only happens early on a fault.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the thread and take the coprocessor back.
    pub fn join(self) -> (Coprocessor, Result<(), Fault>) {
        self.stop.store(true, Ordering::Release);
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
