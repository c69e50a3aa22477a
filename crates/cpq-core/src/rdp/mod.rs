//! Rasterizer command layer.
//!
//! [`Rdpq`] writes rasterizer commands through the queue's rasterizer
//! overlay and inserts partial syncs automatically: before a command changes
//! a resource that an earlier command may still be using, the matching sync
//! is written first.
//!
//! Commands can be built two ways with identical results: the methods on
//! [`Rdpq`] take runtime values, while [`encode`] builds the same commands as
//! `const fn`s for [`Rdpq::emit`].

pub mod autosync;
pub mod encode;
pub mod overlay;

use cpq_hal::{InterruptController, RegisterPort};
use fixed::types::{I22F10, I27F5, I30F2};
use log::{debug, info};

use crate::block::Block;
use crate::command::OverlayId;
use crate::queue::{Queue, QueueMode};

pub use autosync::{Autosync, SyncKind};
pub use encode::RdpCommand;
pub use overlay::{RdpOverlay, RdpStream};

use autosync::{ALL, CFG_AUTOSCISSOR, CFG_DEFAULT};

/// First overlay id of the rasterizer overlay.
pub const RDP_OVERLAY_ID: OverlayId = OverlayId::new(0xC);

#[derive(Debug, Clone, Copy)]
struct BlockState {
    previous: Autosync,
    has_rdp: bool,
}

/// Producer-side rasterizer state: the hazard tracker and its config.
#[derive(Debug)]
pub struct Rdpq {
    autosync: Autosync,
    config: u32,
    block: Option<BlockState>,
}

impl Rdpq {
    /// Bind the rasterizer overlay (if not already bound) with commands
    /// delivered to `stream`.
    pub fn init<P: RegisterPort + InterruptController>(q: &mut Queue<P>, stream: RdpStream) -> Self {
        if !q.registry().is_registered(RDP_OVERLAY_ID) {
            q.overlay_register_static(RdpOverlay::image(stream), RDP_OVERLAY_ID);
        }
        info!("rasterizer layer initialized");
        Self {
            autosync: Autosync::default(),
            config: CFG_DEFAULT,
            block: None,
        }
    }

    /// Unbind the rasterizer overlay.
    pub fn close<P: RegisterPort + InterruptController>(self, q: &mut Queue<P>) {
        if q.is_initialized() && q.registry().is_registered(RDP_OVERLAY_ID) {
            q.overlay_unregister(RDP_OVERLAY_ID);
        }
    }

    pub fn config(&self) -> u32 {
        self.config
    }

    /// Replace the config flags; returns the previous flags.
    pub fn config_set(&mut self, cfg: u32) -> u32 {
        core::mem::replace(&mut self.config, cfg)
    }

    pub fn config_enable(&mut self, cfg: u32) -> u32 {
        self.config_set(self.config | cfg)
    }

    pub fn config_disable(&mut self, cfg: u32) -> u32 {
        self.config_set(self.config & !cfg)
    }

    /// Resources currently assumed in use.
    pub fn autosync(&self) -> u32 {
        self.autosync.in_use()
    }

    /// Write `cmd`, preceded by whatever syncs it needs.
    pub fn emit<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, cmd: &RdpCommand) {
        for kind in self.autosync.syncs_for_change(cmd.change, self.config) {
            let sync = match kind {
                SyncKind::Tile => encode::sync_tile(),
                SyncKind::Load => encode::sync_load(),
                SyncKind::Pipe => encode::sync_pipe(),
            };
            self.write(q, &sync);
        }
        self.write(q, cmd);
    }

    #[inline(never)]
    fn write<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, cmd: &RdpCommand) {
        self.autosync.mark_idle(cmd.clears);
        self.autosync.mark_used(cmd.uses);
        if let Some(block) = self.block.as_mut() {
            block.has_rdp = true;
        }
        let words = cmd.words();
        let opcode = cmd.opcode();
        let id = OverlayId::new(RDP_OVERLAY_ID.get() + (opcode >> 4));
        let mut w = q.write_begin(id, opcode & 0xF, words.len());
        w.first(words[0] & 0x00FF_FFFF);
        w.args(&words[1..]);
        w.end();
    }

    pub fn sync_pipe<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) {
        self.emit(q, &encode::sync_pipe());
    }

    pub fn sync_tile<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) {
        self.emit(q, &encode::sync_tile());
    }

    pub fn sync_load<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) {
        self.emit(q, &encode::sync_load());
    }

    pub fn sync_full<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) {
        self.emit(q, &encode::sync_full());
    }

    pub fn set_other_modes<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, modes: u64) {
        self.emit(q, &encode::set_other_modes(modes));
    }

    pub fn set_combiner<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, comb: u64) {
        self.emit(q, &encode::set_combiner(comb));
    }

    /// Fill color as RGBA8888, converted on the coprocessor to the depth of
    /// the current color image.
    pub fn set_fill_color<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, rgba: u32) {
        self.emit(q, &encode::set_fill_color(rgba));
    }

    pub fn set_prim_color<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, rgba: u32) {
        self.emit(q, &encode::set_prim_color(rgba));
    }

    pub fn set_env_color<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, rgba: u32) {
        self.emit(q, &encode::set_env_color(rgba));
    }

    pub fn set_blend_color<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, rgba: u32) {
        self.emit(q, &encode::set_blend_color(rgba));
    }

    pub fn set_fog_color<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, rgba: u32) {
        self.emit(q, &encode::set_fog_color(rgba));
    }

    /// Set the render target. With [`CFG_AUTOSCISSOR`] the scissor is reset
    /// to the whole target.
    pub fn set_color_image<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        format: u8,
        size: u8,
        width: u16,
        height: u16,
        addr: u32,
    ) {
        assert!(width > 0 && width <= 1024, "color image width {width} out of range");
        self.emit(q, &encode::set_color_image(format, size, width, addr));
        if self.config & CFG_AUTOSCISSOR != 0 {
            self.set_scissor(q, 0.0, 0.0, width as f32, height as f32);
        }
    }

    pub fn set_z_image<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, addr: u32) {
        self.emit(q, &encode::set_z_image(addr));
    }

    pub fn set_texture_image<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        format: u8,
        size: u8,
        width: u16,
        addr: u32,
    ) {
        assert!(width > 0 && width <= 1024, "texture image width {width} out of range");
        self.emit(q, &encode::set_texture_image(format, size, width, addr));
    }

    pub fn set_scissor<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
    ) {
        self.emit(q, &encode::set_scissor(q2(x0), q2(y0), q2(x1), q2(y1)));
    }

    pub fn set_tile<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        format: u8,
        size: u8,
        line: u16,
        tmem_addr: u16,
        palette: u8,
    ) {
        self.emit(q, &encode::set_tile(tile, format, size, line, tmem_addr, palette));
    }

    pub fn set_tile_size<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        s0: f32,
        t0: f32,
        s1: f32,
        t1: f32,
    ) {
        self.emit(q, &encode::set_tile_size(tile, q2(s0), q2(t0), q2(s1), q2(t1)));
    }

    pub fn load_tile<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        s0: f32,
        t0: f32,
        s1: f32,
        t1: f32,
    ) {
        self.emit(q, &encode::load_tile(tile, q2(s0), q2(t0), q2(s1), q2(t1)));
    }

    pub fn load_block<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        s0: u16,
        t0: u16,
        texels: u16,
        dxt: u16,
    ) {
        assert!(texels > 0 && texels <= 2048, "load_block of {texels} texels");
        self.emit(q, &encode::load_block(tile, s0, t0, texels, dxt));
    }

    pub fn load_tlut<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        first: u8,
        count: u16,
    ) {
        assert!(
            count > 0 && first as u16 + count <= 256,
            "palette range {first}+{count} out of range"
        );
        self.emit(q, &encode::load_tlut(tile, first, count));
    }

    pub fn fill_rectangle<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
    ) {
        self.emit(q, &encode::fill_rectangle(q2(x0), q2(y0), q2(x1), q2(y1)));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn texture_rectangle<P: RegisterPort + InterruptController>(
        &mut self,
        q: &mut Queue<P>,
        tile: u8,
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        s: f32,
        t: f32,
        dsdx: f32,
        dtdy: f32,
    ) {
        self.emit(
            q,
            &encode::texture_rectangle(
                tile,
                q2(x0),
                q2(y0),
                q2(x1),
                q2(y1),
                I27F5::saturating_from_num(s),
                I27F5::saturating_from_num(t),
                I22F10::saturating_from_num(dsdx),
                I22F10::saturating_from_num(dtdy),
            ),
        );
    }

    /// Start recording a block. Nothing is known about the hazards at the
    /// point the block will run, so every resource starts out in use.
    pub fn block_begin<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) {
        assert!(self.block.is_none(), "a rasterizer block is already open");
        q.block_begin();
        self.block = Some(BlockState {
            previous: self.autosync,
            has_rdp: false,
        });
        self.autosync = Autosync::new(ALL);
    }

    /// Finish the block, remembering the hazard state it leaves behind if it
    /// wrote rasterizer commands.
    pub fn block_end<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>) -> Block {
        let Some(state) = self.block.take() else {
            panic!("no rasterizer block is open");
        };
        let mut block = q.block_end();
        if state.has_rdp {
            block.rdp_tracking = Some(self.autosync.in_use());
            debug!(
                "block at {:#x} ends with rasterizer resources {:#x} in use",
                block.addr(),
                self.autosync.in_use()
            );
        }
        self.autosync = state.previous;
        block
    }

    /// Run `block`; afterwards the tracker holds the block's final state.
    pub fn block_run<P: RegisterPort + InterruptController>(&mut self, q: &mut Queue<P>, block: &Block) {
        q.block_run(block);
        if q.mode() == QueueMode::Recording {
            if let Some(state) = self.block.as_mut() {
                state.has_rdp |= block.rdp_tracking.is_some();
            }
        }
        self.autosync = Autosync::new(block.rdp_tracking.unwrap_or(ALL));
    }
}

fn q2(v: f32) -> I30F2 {
    I30F2::saturating_from_num(v)
}
