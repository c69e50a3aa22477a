//! Constant-foldable rasterizer command encoders.
//!
//! Every function here is a `const fn`: with constant arguments the whole
//! command, including its hazard masks, folds to a literal at compile time
//! and [`Rdpq::emit`](super::Rdpq::emit) only has to copy words. The runtime
//! methods on [`Rdpq`](super::Rdpq) go through the same functions, so both
//! paths produce the same stream.
//!
//! Coordinates are 10.2 fixed point ([`I30F2`]), texture coordinates s10.5
//! ([`I27F5`]) and texture steps s5.10 ([`I22F10`]).

use fixed::types::{I22F10, I27F5, I30F2};

use super::autosync::{tile, tmem, ALL, PIPE, TILES, TMEMS};

/// Rasterizer opcodes (6 bits).
pub mod op {
    /// Fixup: scissor that the overlay also records.
    pub const SET_SCISSOR_EX: u8 = 0x07;
    /// Fixup: 32-bit fill color, converted to the target's depth.
    pub const SET_FILL_COLOR_32: u8 = 0x16;
    pub const TEXTURE_RECTANGLE: u8 = 0x24;
    pub const TEXTURE_RECTANGLE_FLIP: u8 = 0x25;
    pub const SYNC_PIPE: u8 = 0x27;
    pub const SYNC_TILE: u8 = 0x28;
    pub const SYNC_FULL: u8 = 0x29;
    pub const SET_SCISSOR: u8 = 0x2D;
    pub const SET_OTHER_MODES: u8 = 0x2F;
    pub const LOAD_TLUT: u8 = 0x30;
    pub const SYNC_LOAD: u8 = 0x31;
    pub const SET_TILE_SIZE: u8 = 0x32;
    pub const LOAD_BLOCK: u8 = 0x33;
    pub const LOAD_TILE: u8 = 0x34;
    pub const SET_TILE: u8 = 0x35;
    pub const FILL_RECTANGLE: u8 = 0x36;
    pub const SET_FILL_COLOR: u8 = 0x37;
    pub const SET_FOG_COLOR: u8 = 0x38;
    pub const SET_BLEND_COLOR: u8 = 0x39;
    pub const SET_PRIM_COLOR: u8 = 0x3A;
    pub const SET_ENV_COLOR: u8 = 0x3B;
    pub const SET_COMBINE: u8 = 0x3C;
    pub const SET_TEXTURE_IMAGE: u8 = 0x3D;
    pub const SET_Z_IMAGE: u8 = 0x3E;
    pub const SET_COLOR_IMAGE: u8 = 0x3F;

    /// Queue opcode byte of a rasterizer opcode: overlay ids 0xC-0xF.
    pub const fn queue_opcode(op: u8) -> u8 {
        0xC0 | (op & 0x3F)
    }
}

/// Pixel size field of image and tile commands.
pub mod size {
    pub const BPP4: u8 = 0;
    pub const BPP8: u8 = 1;
    pub const BPP16: u8 = 2;
    pub const BPP32: u8 = 3;
}

/// One encoded rasterizer command plus its effect on the hazard tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdpCommand {
    pub words: [u32; 4],
    /// 2 or 4.
    pub len: u8,
    /// Resources this command modifies.
    pub change: u32,
    /// Resources this command reads while it executes.
    pub uses: u32,
    /// Resources this command guarantees idle (syncs).
    pub clears: u32,
}

impl RdpCommand {
    pub fn words(&self) -> &[u32] {
        &self.words[..self.len as usize]
    }

    /// Rasterizer opcode.
    pub const fn opcode(&self) -> u8 {
        ((self.words[0] >> 24) & 0x3F) as u8
    }
}

const fn cmd8(op: u8, w0: u32, w1: u32) -> RdpCommand {
    RdpCommand {
        words: [((op::queue_opcode(op) as u32) << 24) | (w0 & 0x00FF_FFFF), w1, 0, 0],
        len: 2,
        change: 0,
        uses: 0,
        clears: 0,
    }
}

const fn change(mut c: RdpCommand, res: u32) -> RdpCommand {
    c.change = res;
    c
}

const fn uses(mut c: RdpCommand, res: u32) -> RdpCommand {
    c.uses = res;
    c
}

const fn clears(mut c: RdpCommand, res: u32) -> RdpCommand {
    c.clears = res;
    c
}

/// 12-bit 10.2 coordinate field.
const fn q2(v: I30F2) -> u32 {
    (v.to_bits() as u32) & 0xFFF
}

/// 16-bit texture field.
const fn st(v: I27F5) -> u32 {
    (v.to_bits() as u32) & 0xFFFF
}

const fn step(v: I22F10) -> u32 {
    (v.to_bits() as u32) & 0xFFFF
}

pub const fn sync_pipe() -> RdpCommand {
    clears(cmd8(op::SYNC_PIPE, 0, 0), PIPE)
}

pub const fn sync_tile() -> RdpCommand {
    clears(cmd8(op::SYNC_TILE, 0, 0), TILES)
}

pub const fn sync_load() -> RdpCommand {
    clears(cmd8(op::SYNC_LOAD, 0, 0), TMEMS)
}

/// Waits for the whole pipeline to drain.
pub const fn sync_full() -> RdpCommand {
    clears(cmd8(op::SYNC_FULL, 0, 0), ALL)
}

/// Raw 56-bit other-modes value.
pub const fn set_other_modes(modes: u64) -> RdpCommand {
    change(cmd8(op::SET_OTHER_MODES, (modes >> 32) as u32, modes as u32), PIPE)
}

/// Raw 56-bit color combiner value.
pub const fn set_combiner(comb: u64) -> RdpCommand {
    change(cmd8(op::SET_COMBINE, (comb >> 32) as u32, comb as u32), PIPE)
}

/// Fill color as RGBA8888; converted by the overlay to the target depth.
pub const fn set_fill_color(rgba: u32) -> RdpCommand {
    change(cmd8(op::SET_FILL_COLOR_32, 0, rgba), PIPE)
}

/// Primitive color is latched per primitive, so no sync is needed.
pub const fn set_prim_color(rgba: u32) -> RdpCommand {
    cmd8(op::SET_PRIM_COLOR, 0, rgba)
}

pub const fn set_env_color(rgba: u32) -> RdpCommand {
    change(cmd8(op::SET_ENV_COLOR, 0, rgba), PIPE)
}

pub const fn set_blend_color(rgba: u32) -> RdpCommand {
    change(cmd8(op::SET_BLEND_COLOR, 0, rgba), PIPE)
}

pub const fn set_fog_color(rgba: u32) -> RdpCommand {
    change(cmd8(op::SET_FOG_COLOR, 0, rgba), PIPE)
}

const fn image(format: u8, size: u8, width: u16) -> u32 {
    ((format as u32 & 0x7) << 21) | ((size as u32 & 0x3) << 19) | ((width as u32 - 1) & 0x3FF)
}

/// Render target; the overlay records its pixel size for fill colors.
pub const fn set_color_image(format: u8, size: u8, width: u16, addr: u32) -> RdpCommand {
    change(
        cmd8(op::SET_COLOR_IMAGE, image(format, size, width), addr & 0x03FF_FFFF),
        PIPE,
    )
}

pub const fn set_z_image(addr: u32) -> RdpCommand {
    change(cmd8(op::SET_Z_IMAGE, 0, addr & 0x03FF_FFFF), PIPE)
}

/// Source of the next texture load. Loads latch it, so no sync is needed.
pub const fn set_texture_image(format: u8, size: u8, width: u16, addr: u32) -> RdpCommand {
    cmd8(op::SET_TEXTURE_IMAGE, image(format, size, width), addr & 0x03FF_FFFF)
}

/// Scissor rectangle, exclusive of the bottom-right edge.
pub const fn set_scissor(x0: I30F2, y0: I30F2, x1: I30F2, y1: I30F2) -> RdpCommand {
    cmd8(
        op::SET_SCISSOR_EX,
        (q2(x0) << 12) | q2(y0),
        (q2(x1) << 12) | q2(y1),
    )
}

/// Tile descriptor: `line` is the row stride and `tmem_addr` the TMEM
/// offset, both in 64-bit words.
pub const fn set_tile(
    tile_idx: u8,
    format: u8,
    size: u8,
    line: u16,
    tmem_addr: u16,
    palette: u8,
) -> RdpCommand {
    change(
        cmd8(
            op::SET_TILE,
            ((format as u32 & 0x7) << 21)
                | ((size as u32 & 0x3) << 19)
                | ((line as u32 & 0x1FF) << 9)
                | (tmem_addr as u32 & 0x1FF),
            ((tile_idx as u32 & 0x7) << 24) | ((palette as u32 & 0xF) << 20),
        ),
        tile(tile_idx),
    )
}

pub const fn set_tile_size(tile_idx: u8, s0: I30F2, t0: I30F2, s1: I30F2, t1: I30F2) -> RdpCommand {
    change(
        cmd8(
            op::SET_TILE_SIZE,
            (q2(s0) << 12) | q2(t0),
            ((tile_idx as u32 & 0x7) << 24) | (q2(s1) << 12) | q2(t1),
        ),
        tile(tile_idx),
    )
}

const fn load(c: RdpCommand, tile_idx: u8) -> RdpCommand {
    uses(change(c, tmem(0)), tile(tile_idx))
}

pub const fn load_tile(tile_idx: u8, s0: I30F2, t0: I30F2, s1: I30F2, t1: I30F2) -> RdpCommand {
    load(
        cmd8(
            op::LOAD_TILE,
            (q2(s0) << 12) | q2(t0),
            ((tile_idx as u32 & 0x7) << 24) | (q2(s1) << 12) | q2(t1),
        ),
        tile_idx,
    )
}

/// Load `texels` texels starting at (`s0`, `t0`) with row increment `dxt`
/// (1.11 fixed point).
pub const fn load_block(tile_idx: u8, s0: u16, t0: u16, texels: u16, dxt: u16) -> RdpCommand {
    load(
        cmd8(
            op::LOAD_BLOCK,
            ((s0 as u32 & 0xFFF) << 12) | (t0 as u32 & 0xFFF),
            ((tile_idx as u32 & 0x7) << 24)
                | (((texels as u32 - 1) & 0xFFF) << 12)
                | (dxt as u32 & 0xFFF),
        ),
        tile_idx,
    )
}

/// Load palette entries `first..first + count`.
pub const fn load_tlut(tile_idx: u8, first: u8, count: u16) -> RdpCommand {
    let lo = first as u32;
    let hi = lo + count as u32 - 1;
    load(
        cmd8(
            op::LOAD_TLUT,
            (lo << 2) << 12,
            ((tile_idx as u32 & 0x7) << 24) | (((hi << 2) & 0xFFF) << 12),
        ),
        tile_idx,
    )
}

/// Fill from (`x0`, `y0`) to (`x1`, `y1`) with the fill color.
pub const fn fill_rectangle(x0: I30F2, y0: I30F2, x1: I30F2, y1: I30F2) -> RdpCommand {
    uses(
        cmd8(op::FILL_RECTANGLE, (q2(x1) << 12) | q2(y1), (q2(x0) << 12) | q2(y0)),
        PIPE,
    )
}

/// Textured rectangle sampling `tile_idx`, starting at texture coordinate
/// (`s`, `t`) and stepping by (`dsdx`, `dtdy`) per pixel.
#[allow(clippy::too_many_arguments)]
pub const fn texture_rectangle(
    tile_idx: u8,
    x0: I30F2,
    y0: I30F2,
    x1: I30F2,
    y1: I30F2,
    s: I27F5,
    t: I27F5,
    dsdx: I22F10,
    dtdy: I22F10,
) -> RdpCommand {
    let mut c = cmd8(
        op::TEXTURE_RECTANGLE,
        (q2(x1) << 12) | q2(y1),
        ((tile_idx as u32 & 0x7) << 24) | (q2(x0) << 12) | q2(y0),
    );
    c.words[2] = (st(s) << 16) | st(t);
    c.words[3] = (step(dsdx) << 16) | step(dtdy);
    c.len = 4;
    uses(c, PIPE | tile(tile_idx) | tmem(0))
}
