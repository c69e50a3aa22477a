//! Rasterizer hazard tracker.
//!
//! Each bit is a hardware resource that a queued command may still be using:
//! eight tile descriptors, texture memory, and the pipeline configuration.
//! Changing a resource that is in use needs the matching sync first; a sync
//! marks its resources idle again.

/// Tile descriptor `n`.
pub const fn tile(n: u8) -> u32 {
    assert!(n < 8, "tile index out of range");
    1 << n
}

/// All tile descriptors.
pub const TILES: u32 = 0xFF;

/// Texture memory unit `n`. Texture memory is tracked as unit 0 only.
pub const fn tmem(n: u8) -> u32 {
    assert!(n < 8, "tmem unit out of range");
    1 << (8 + n)
}

/// All texture memory units.
pub const TMEMS: u32 = 0xFF00;

/// Pipeline configuration (render modes, combiner, colors, target images).
pub const PIPE: u32 = 1 << 16;

/// Every resource; the state assumed when nothing is known.
pub const ALL: u32 = !0;

/// Config flags enabling each automatic sync.
pub const CFG_AUTOSYNC_PIPE: u32 = 1 << 0;
pub const CFG_AUTOSYNC_LOAD: u32 = 1 << 1;
pub const CFG_AUTOSYNC_TILE: u32 = 1 << 2;
/// Emit a full-target scissor whenever the color image changes.
pub const CFG_AUTOSCISSOR: u32 = 1 << 3;
pub const CFG_DEFAULT: u32 =
    CFG_AUTOSYNC_PIPE | CFG_AUTOSYNC_LOAD | CFG_AUTOSYNC_TILE | CFG_AUTOSCISSOR;

/// A partial sync command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Tile,
    Load,
    Pipe,
}

/// Resources possibly in use by commands already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Autosync(u32);

impl Autosync {
    pub const fn new(in_use: u32) -> Self {
        Self(in_use)
    }

    pub const fn in_use(&self) -> u32 {
        self.0
    }

    pub fn mark_used(&mut self, res: u32) {
        self.0 |= res;
    }

    pub fn mark_idle(&mut self, res: u32) {
        self.0 &= !res;
    }

    /// Syncs to emit, in order, before a command that changes `res`.
    /// Only kinds enabled in `config` are returned.
    pub fn syncs_for_change(&self, res: u32, config: u32) -> heapless::Vec<SyncKind, 3> {
        let hit = res & self.0;
        let mut out: heapless::Vec<SyncKind, 3> = heapless::Vec::new();
        let mut add = |kind: SyncKind| {
            // Capacity covers all three kinds.
            let _ = out.push(kind);
        };
        if hit & TILES != 0 && config & CFG_AUTOSYNC_TILE != 0 {
            add(SyncKind::Tile);
        }
        if hit & TMEMS != 0 && config & CFG_AUTOSYNC_LOAD != 0 {
            add(SyncKind::Load);
        }
        if hit & PIPE != 0 && config & CFG_AUTOSYNC_PIPE != 0 {
            add(SyncKind::Pipe);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_disjoint() {
        assert_eq!(TILES & TMEMS, 0);
        assert_eq!((TILES | TMEMS) & PIPE, 0);
        assert_eq!(tile(7), 0x80);
        assert_eq!(tmem(0), 0x100);
    }

    #[test]
    fn test_change_of_idle_resource_needs_nothing() {
        let a = Autosync::new(tile(1));
        assert!(a.syncs_for_change(tile(2) | PIPE, CFG_DEFAULT).is_empty());
    }

    #[test]
    fn test_change_order_is_tile_load_pipe() {
        let a = Autosync::new(ALL);
        let syncs = a.syncs_for_change(ALL, CFG_DEFAULT);
        assert_eq!(
            syncs.as_slice(),
            &[SyncKind::Tile, SyncKind::Load, SyncKind::Pipe]
        );
    }

    #[test]
    fn test_config_gates_syncs() {
        let a = Autosync::new(ALL);
        let syncs = a.syncs_for_change(PIPE | tmem(0), CFG_AUTOSYNC_LOAD);
        assert_eq!(syncs.as_slice(), &[SyncKind::Load]);
    }

    #[test]
    fn test_mark_idle() {
        let mut a = Autosync::new(0);
        a.mark_used(PIPE | tile(3));
        a.mark_idle(TILES);
        assert_eq!(a.in_use(), PIPE);
    }
}
