//! Shared test fixtures: a recording overlay and a queue wired to a
//! simulated coprocessor.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use cpq_core::dispatch::{CommandContext, Coprocessor, Fault, OverlayCode, SimRegisters};
use cpq_core::{OverlayHeader, OverlayImage, Queue, QueueConfig, SharedMemory};

/// Captured overlay command: (command number, words after the first,
/// low 24 bits of the first word).
pub type CommandRecord = (u16, Vec<u32>, u32);

/// Overlay that records every command it executes.
///
/// Command 0 additionally adds its first argument to state word 0, so tests
/// can observe state persistence across overlay switches.
#[derive(Clone, Default)]
pub struct RecordingOverlay {
    log: Arc<Mutex<Vec<CommandRecord>>>,
}

impl RecordingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything executed so far.
    pub fn records(&self) -> Vec<CommandRecord> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// First argument of every command, in execution order.
    pub fn tags(&self) -> Vec<u32> {
        self.records()
            .iter()
            .map(|(_, args, _)| args.first().copied().unwrap_or(0))
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Image with the given per-command sizes and 16 state bytes.
    pub fn image(&self, name: &str, sizes: &[u8]) -> OverlayImage {
        OverlayImage::new(
            name,
            OverlayHeader::new(16, sizes).unwrap(),
            Arc::new(self.clone()),
        )
        .unwrap()
    }
}

impl OverlayCode for RecordingOverlay {
    fn execute(&self, ctx: &mut CommandContext<'_>, command: u16, words: &[u32]) -> Result<(), Fault> {
        if command == 0 && words.len() > 1 {
            ctx.state_mut()[0] = ctx.state()[0].wrapping_add(words[1]);
        }
        self.log.lock().unwrap_or_else(PoisonError::into_inner).push((
            command,
            words[1..].to_vec(),
            words[0] & 0x00FF_FFFF,
        ));
        Ok(())
    }
}

/// A queue and a simulated coprocessor sharing one memory.
///
/// The register idle hook steps the coprocessor, so producer calls that
/// block (waits, a full ring) make progress on the test thread. Never hold
/// the coprocessor lock across a queue call.
pub struct Harness {
    pub mem: Arc<SharedMemory>,
    pub regs: Arc<SimRegisters>,
    pub cop: Arc<Mutex<Coprocessor>>,
    pub q: Queue<Arc<SimRegisters>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mem = SharedMemory::new(1 << 20);
        let regs = Arc::new(SimRegisters::new());
        let cop = Arc::new(Mutex::new(Coprocessor::new(mem.clone(), regs.clone())));
        let hook_cop = cop.clone();
        regs.set_idle_hook(Some(Box::new(move || {
            if let Ok(mut cop) = hook_cop.try_lock() {
                let _ = cop.step();
            }
        })));
        let mut q = Queue::new(regs.clone(), mem.clone(), config);
        q.init();
        Self { mem, regs, cop, q }
    }

    /// Step the coprocessor until it halts.
    pub fn run(&self) -> Result<(), Fault> {
        self.cop.lock().unwrap().run_until_halted()
    }

    pub fn with_cop<R>(&self, f: impl FnOnce(&mut Coprocessor) -> R) -> R {
        f(&mut self.cop.lock().unwrap())
    }
}

/// Small ring config for wraparound tests.
pub fn small_rings(lowpri: u32, highpri: u32) -> QueueConfig {
    QueueConfig {
        lowpri_ring_words: lowpri,
        highpri_ring_words: highpri,
        ..QueueConfig::default()
    }
}
