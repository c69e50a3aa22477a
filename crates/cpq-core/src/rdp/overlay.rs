//! Consumer side of the rasterizer overlay.
//!
//! Most commands are forwarded unchanged. A few fixups depend on state only
//! the consumer knows at execution time, such as the depth of the current
//! render target, and are resolved here.

use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use super::encode::{op, size};
use crate::dispatch::{CommandContext, Fault, OverlayCode};
use crate::overlay::{OverlayHeader, OverlayImage};

/// Persistent state layout, in words.
mod state {
    /// Last requested fill color, RGBA8888.
    pub const FILL_COLOR: usize = 0;
    /// Pixel size of the color image plus one; 0 before any color image.
    pub const TARGET_SIZE: usize = 1;
    pub const SCISSOR_W0: usize = 2;
    pub const SCISSOR_W1: usize = 3;
    pub const BYTES: u32 = 16;
}

/// Commands in the rasterizer overlay: ids 0xC to 0xF.
pub const COMMAND_COUNT: usize = 64;

/// Where the overlay delivers rasterizer commands. Cloned handles share one
/// buffer.
#[derive(Debug, Clone, Default)]
pub struct RdpStream {
    inner: Arc<Mutex<StreamInner>>,
}

#[derive(Debug, Default)]
struct StreamInner {
    commands: Vec<u64>,
    full_syncs: u32,
}

impl RdpStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, cmd: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if (cmd >> 56) as u8 == op::SYNC_FULL {
            inner.full_syncs += 1;
        }
        inner.commands.push(cmd);
    }

    /// Every 64-bit word delivered so far.
    pub fn commands(&self) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commands
            .clone()
    }

    /// Rasterizer opcode of each delivered command, skipping the second
    /// word of texture rectangles.
    pub fn opcodes(&self) -> Vec<u8> {
        let commands = self.commands();
        let mut out = Vec::with_capacity(commands.len());
        let mut i = 0;
        while i < commands.len() {
            let opcode = (commands[i] >> 56) as u8;
            out.push(opcode);
            i += if is_rect(opcode) { 2 } else { 1 };
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commands
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SYNC_FULL commands delivered so far.
    pub fn full_syncs(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .full_syncs
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.commands.clear();
        inner.full_syncs = 0;
    }
}

fn is_rect(opcode: u8) -> bool {
    opcode == op::TEXTURE_RECTANGLE || opcode == op::TEXTURE_RECTANGLE_FLIP
}

/// Native 64-bit command from two queue words.
fn native(w0: u32, w1: u32) -> u64 {
    (((w0 & 0x3FFF_FFFF) as u64) << 32) | w1 as u64
}

fn native_op(opcode: u8, w0: u32, w1: u32) -> u64 {
    native(((opcode as u32) << 24) | (w0 & 0x00FF_FFFF), w1)
}

/// Convert an RGBA8888 color to the packed fill value for a target of
/// pixel size `target` (`None` before any color image is set).
fn fill_value(rgba: u32, target: Option<u8>, command: u16) -> Result<u32, Fault> {
    match target {
        None | Some(size::BPP32) => Ok(rgba),
        Some(size::BPP16) => {
            let [r, g, b, a] = rgba.to_be_bytes().map(u32::from);
            let c = ((r >> 3) << 11) | ((g >> 3) << 6) | ((b >> 3) << 1) | (a >> 7);
            Ok((c << 16) | c)
        }
        Some(size::BPP8) => Ok((rgba >> 24) * 0x0101_0101),
        Some(_) => Err(Fault::Overlay {
            command,
            reason: "fill color on a 4-bit color image".into(),
        }),
    }
}

/// Coprocessor code of the rasterizer overlay.
pub struct RdpOverlay {
    stream: RdpStream,
}

impl RdpOverlay {
    pub fn new(stream: RdpStream) -> Self {
        Self { stream }
    }

    /// Overlay header: texture rectangles are four words, every other
    /// command two.
    pub fn header() -> OverlayHeader {
        let mut sizes = [2u8; COMMAND_COUNT];
        sizes[op::TEXTURE_RECTANGLE as usize] = 4;
        sizes[op::TEXTURE_RECTANGLE_FLIP as usize] = 4;
        match OverlayHeader::new(state::BYTES, &sizes) {
            Ok(header) => header,
            Err(e) => panic!("rasterizer overlay header is invalid: {e}"),
        }
    }

    /// Loadable image delivering into `stream`.
    pub fn image(stream: RdpStream) -> OverlayImage {
        match OverlayImage::new("rdpq", Self::header(), Arc::new(Self::new(stream))) {
            Ok(image) => image,
            Err(e) => panic!("rasterizer overlay image is invalid: {e}"),
        }
    }

    fn set_fill_color(&self, ctx: &mut CommandContext<'_>, command: u16, rgba: u32) -> Result<(), Fault> {
        ctx.state_mut()[state::FILL_COLOR] = rgba;
        let target = match ctx.state()[state::TARGET_SIZE] {
            0 => None,
            n => Some((n - 1) as u8),
        };
        let value = fill_value(rgba, target, command)?;
        self.stream.push(native_op(op::SET_FILL_COLOR, 0, value));
        Ok(())
    }
}

impl OverlayCode for RdpOverlay {
    fn execute(&self, ctx: &mut CommandContext<'_>, command: u16, words: &[u32]) -> Result<(), Fault> {
        let opcode = command as u8;
        trace!("rdp command {opcode:#04x}");
        match opcode {
            op::SET_FILL_COLOR_32 => self.set_fill_color(ctx, command, words[1])?,
            op::SET_COLOR_IMAGE => {
                let pixel = ((words[0] >> 19) & 0x3) as u8;
                ctx.state_mut()[state::TARGET_SIZE] = pixel as u32 + 1;
                self.stream.push(native(words[0], words[1]));
                // The packed fill value depends on the target depth. 4-bit
                // targets cannot be filled at all.
                if pixel != size::BPP4 {
                    let rgba = ctx.state()[state::FILL_COLOR];
                    self.set_fill_color(ctx, command, rgba)?;
                }
            }
            op::SET_SCISSOR_EX => {
                let st = ctx.state_mut();
                st[state::SCISSOR_W0] = words[0] & 0x00FF_FFFF;
                st[state::SCISSOR_W1] = words[1];
                self.stream.push(native_op(op::SET_SCISSOR, words[0], words[1]));
            }
            _ if is_rect(opcode) => {
                self.stream.push(native(words[0], words[1]));
                self.stream.push(((words[2] as u64) << 32) | words[3] as u64);
            }
            _ if opcode >= op::TEXTURE_RECTANGLE => self.stream.push(native(words[0], words[1])),
            _ => {
                return Err(Fault::Overlay {
                    command,
                    reason: format!("unknown rasterizer command {opcode:#04x}"),
                })
            }
        }
        Ok(())
    }
}
