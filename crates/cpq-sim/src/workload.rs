//! Workloads driven against a coprocessor running on its own thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use cpq_core::dispatch::{
    CommandContext, ConsumerStats, ConsumerThread, Coprocessor, Fault, OverlayCode, SimRegisters,
};
use cpq_core::rdp::encode::{op, size};
use cpq_core::rdp::{RdpStream, Rdpq};
use cpq_core::{OverlayHeader, OverlayId, OverlayImage, Queue, QueueConfig, SharedMemory};
use log::{debug, info};

/// Bytes of shared memory given to every run.
const MEMORY_BYTES: usize = 4 << 20;

/// Overlay that counts commands and folds their arguments into a checksum.
#[derive(Default)]
struct Counter {
    commands: AtomicU64,
    checksum: AtomicU64,
}

impl OverlayCode for Counter {
    fn execute(&self, ctx: &mut CommandContext<'_>, _command: u16, words: &[u32]) -> Result<(), Fault> {
        let sum = words[1..]
            .iter()
            .fold(u64::from(words[0] & 0x00FF_FFFF), |acc, &w| {
                acc.rotate_left(5) ^ u64::from(w)
            });
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.checksum.fetch_xor(sum, Ordering::Relaxed);
        ctx.state_mut()[0] = ctx.state()[0].wrapping_add(1);
        Ok(())
    }
}

/// Producer, consumer thread and the counter overlay bound at id 1.
struct Rig {
    q: Queue<Arc<SimRegisters>>,
    regs: Arc<SimRegisters>,
    consumer: Option<ConsumerThread>,
    counter: Arc<Counter>,
    started: Instant,
}

const COUNTER_ID: OverlayId = OverlayId::new(1);

impl Rig {
    fn new(config: QueueConfig) -> anyhow::Result<Self> {
        let mem = SharedMemory::new(MEMORY_BYTES);
        let regs = Arc::new(SimRegisters::new());
        let consumer = Coprocessor::new(mem.clone(), regs.clone()).spawn();

        let mut q = Queue::new(regs.clone(), mem, config);
        q.init();

        let counter = Arc::new(Counter::default());
        let header = OverlayHeader::new(16, &[2, 3, 4]).context("counter overlay header")?;
        let image = OverlayImage::new("counter", header, counter.clone())
            .context("counter overlay image")?;
        q.overlay_register_static(image, COUNTER_ID);

        Ok(Self {
            q,
            regs,
            consumer: Some(consumer),
            counter,
            started: Instant::now(),
        })
    }

    fn command(&mut self, i: u32) {
        match i % 3 {
            0 => self.q.write(COUNTER_ID, 0, &[i]),
            1 => self.q.write(COUNTER_ID, 1, &[i, !i]),
            _ => self.q.write(COUNTER_ID, 2, &[i, i << 1, i << 2]),
        }
    }

    /// Wait for everything enqueued, stop the consumer and report.
    fn finish(mut self, name: &str) -> anyhow::Result<Report> {
        let consumer = self.consumer.take().context("consumer already stopped")?;
        if consumer.is_finished() {
            let (_, result) = consumer.join();
            result.context("consumer faulted")?;
            bail!("consumer stopped early");
        }
        self.q.wait();
        let elapsed = self.started.elapsed();

        let state = self.q.overlay_get_state(COUNTER_ID).read(0);
        self.q.close();
        let (cop, result) = consumer.join();
        result.context("consumer faulted")?;

        let report = Report {
            name: name.to_string(),
            elapsed,
            overlay_commands: self.counter.commands.load(Ordering::Relaxed),
            checksum: self.counter.checksum.load(Ordering::Relaxed),
            state_counter: state,
            doorbells: self.regs.doorbell_count(),
            stats: cop.stats(),
            rdp_commands: None,
        };
        debug!("{report:?}");
        Ok(report)
    }
}

#[derive(Debug)]
pub struct Report {
    pub name: String,
    pub elapsed: Duration,
    pub overlay_commands: u64,
    pub checksum: u64,
    pub state_counter: u32,
    pub doorbells: u32,
    pub stats: ConsumerStats,
    pub rdp_commands: Option<usize>,
}

impl Report {
    pub fn print(&self) {
        println!("{}:", self.name);
        println!("  elapsed          {:.3} ms", self.elapsed.as_secs_f64() * 1e3);
        println!("  overlay commands {}", self.overlay_commands);
        println!("  checksum         {:#018x}", self.checksum);
        println!("  state counter    {}", self.state_counter);
        println!("  doorbells        {}", self.doorbells);
        println!(
            "  consumer         {} commands, {} internal, {} switches, {} halts, {} wakeups",
            self.stats.commands,
            self.stats.internal,
            self.stats.overlay_switches,
            self.stats.halts,
            self.stats.wakeups
        );
        if let Some(n) = self.rdp_commands {
            println!("  rdp commands     {n}");
        }
    }

    /// The counter overlay saw every command exactly once and its state
    /// survived every switch.
    fn check(&self, expected: u64) -> anyhow::Result<()> {
        if self.overlay_commands != expected {
            bail!(
                "{}: expected {expected} overlay commands, consumer executed {}",
                self.name,
                self.overlay_commands
            );
        }
        if u64::from(self.state_counter) != expected & 0xFFFF_FFFF {
            bail!(
                "{}: overlay state counter is {}, expected {expected}",
                self.name,
                self.state_counter
            );
        }
        Ok(())
    }
}

/// Plain stream of mixed-size commands, waited on with a syncpoint every
/// `sync_every` commands.
pub fn stream(config: QueueConfig, commands: u32, sync_every: u32) -> anyhow::Result<Report> {
    let mut rig = Rig::new(config)?;
    for i in 0..commands {
        rig.command(i);
        if sync_every != 0 && (i + 1) % sync_every == 0 {
            let sp = rig.q.syncpoint_new();
            rig.q.syncpoint_wait(sp);
        }
    }
    let report = rig.finish("stream")?;
    report.check(u64::from(commands))?;
    Ok(report)
}

/// One recorded block of `block_len` commands, nested `depth` deep and
/// replayed `runs` times.
pub fn blocks(config: QueueConfig, block_len: u32, depth: u32, runs: u32) -> anyhow::Result<Report> {
    if depth == 0 || depth > cpq_core::config::MAX_BLOCK_NESTING {
        bail!(
            "depth must be between 1 and {}",
            cpq_core::config::MAX_BLOCK_NESTING
        );
    }
    let mut rig = Rig::new(config)?;

    let mut chain = Vec::new();
    for _ in 0..depth {
        rig.q.block_begin();
        for i in 0..block_len {
            rig.command(i);
        }
        if let Some(callee) = chain.last() {
            rig.q.block_run(callee);
        }
        chain.push(rig.q.block_end());
    }
    let outer = chain.last().context("no block recorded")?;
    info!(
        "recorded {depth} nested blocks, outer is {} words in {} chunks",
        outer.len_words(),
        outer.chunk_count()
    );

    for _ in 0..runs {
        rig.q.block_run(outer);
    }
    rig.q.wait();
    for block in chain.drain(..).rev() {
        rig.q.block_free(block);
    }

    let report = rig.finish("blocks")?;
    report.check(u64::from(block_len) * u64::from(depth) * u64::from(runs))?;
    Ok(report)
}

/// Primary stream with a high-priority bracket of `bracket_len` commands
/// opened every `every` primary commands.
pub fn highpri(config: QueueConfig, commands: u32, every: u32, bracket_len: u32) -> anyhow::Result<Report> {
    if every == 0 {
        bail!("bracket interval must be non-zero");
    }
    let mut rig = Rig::new(config)?;
    let mut brackets = 0u64;
    for i in 0..commands {
        rig.command(i);
        if (i + 1) % every == 0 {
            rig.q.highpri_begin();
            for j in 0..bracket_len {
                rig.command(j);
            }
            rig.q.highpri_end();
            brackets += 1;
        }
    }
    rig.q.highpri_sync();
    let report = rig.finish("highpri")?;
    report.check(u64::from(commands) + brackets * u64::from(bracket_len))?;
    Ok(report)
}

/// Textured rectangles through the rasterizer layer, each with a tile
/// reload so every hazard kind is exercised.
pub fn rdp(config: QueueConfig, rects: u32) -> anyhow::Result<Report> {
    let mut rig = Rig::new(config)?;
    let stream = RdpStream::new();
    let mut rdpq = Rdpq::init(&mut rig.q, stream.clone());

    rdpq.set_color_image(&mut rig.q, 0, size::BPP16, 320, 240, 0x10_0000);
    rdpq.set_fill_color(&mut rig.q, 0x2040_60FF);
    rdpq.fill_rectangle(&mut rig.q, 0.0, 0.0, 320.0, 240.0);
    rdpq.set_texture_image(&mut rig.q, 0, size::BPP16, 32, 0x20_0000);

    for i in 0..rects {
        let tile = (i % 2) as u8;
        let x = (i % 20) as f32 * 16.0;
        let y = (i / 20 % 15) as f32 * 16.0;
        rdpq.set_tile(&mut rig.q, 7, 0, size::BPP16, 0, 0, 0);
        rdpq.load_block(&mut rig.q, 7, 0, 0, 256, 0x800);
        rdpq.set_tile(&mut rig.q, tile, 0, size::BPP16, 8, 0, 0);
        rdpq.set_tile_size(&mut rig.q, tile, 0.0, 0.0, 15.0, 15.0);
        rdpq.texture_rectangle(&mut rig.q, tile, x, y, x + 16.0, y + 16.0, 0.0, 0.0, 1.0, 1.0);
    }
    rdpq.sync_full(&mut rig.q);
    rig.q.wait();

    let opcodes = stream.opcodes();
    let count = |o: u8| opcodes.iter().filter(|&&x| x == o).count();
    info!(
        "rdp: {} pipe, {} tile, {} load syncs, {} full",
        count(op::SYNC_PIPE),
        count(op::SYNC_TILE),
        count(op::SYNC_LOAD),
        stream.full_syncs()
    );
    if count(op::TEXTURE_RECTANGLE) != rects as usize {
        bail!(
            "rdp: expected {rects} texture rectangles, stream has {}",
            count(op::TEXTURE_RECTANGLE)
        );
    }
    rdpq.close(&mut rig.q);

    let mut report = rig.finish("rdp")?;
    report.rdp_commands = Some(opcodes.len());
    Ok(report)
}
