//! Rasterizer layer tests: automatic sync insertion, fixups and block
//! hazard tracking.

mod common;

use common::Harness;
use cpq_core::dispatch::Fault;
use cpq_core::rdp::autosync::{
    tile, tmem, ALL, CFG_AUTOSCISSOR, CFG_AUTOSYNC_PIPE, CFG_DEFAULT, PIPE,
};
use cpq_core::rdp::encode::{self, op, size, RdpCommand};
use cpq_core::rdp::{RdpStream, Rdpq, RDP_OVERLAY_ID};
use fixed::types::{I22F10, I27F5, I30F2};

const RGBA: u8 = 0;

fn setup() -> (Harness, Rdpq, RdpStream) {
    let mut h = Harness::new();
    let stream = RdpStream::new();
    let rdp = Rdpq::init(&mut h.q, stream.clone());
    h.run().unwrap();
    (h, rdp, stream)
}

/// Coordinate in 10.2 from whole pixels.
const fn px(v: i32) -> I30F2 {
    I30F2::from_bits(v * 4)
}

// ============================================================================
// Autosync
// ============================================================================

mod autosync_tests {
    use super::*;

    #[test]
    fn mode_change_after_draw_inserts_sync_pipe() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_other_modes(&mut h.q, 0x1);
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 16.0, 16.0);
        rdp.set_other_modes(&mut h.q, 0x2);
        h.run().unwrap();

        assert_eq!(
            stream.opcodes(),
            vec![op::SET_OTHER_MODES, op::FILL_RECTANGLE, op::SYNC_PIPE, op::SET_OTHER_MODES]
        );
    }

    #[test]
    fn changes_without_draws_need_no_sync() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_other_modes(&mut h.q, 0x1);
        rdp.set_combiner(&mut h.q, 0x2);
        rdp.set_env_color(&mut h.q, 0x3);
        h.run().unwrap();

        assert!(!stream.opcodes().contains(&op::SYNC_PIPE));
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn tile_reuse_inserts_sync_tile_only_for_that_tile() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_tile(&mut h.q, 0, RGBA, size::BPP16, 8, 0, 0);
        rdp.texture_rectangle(&mut h.q, 0, 0.0, 0.0, 8.0, 8.0, 0.0, 0.0, 1.0, 1.0);
        assert_eq!(rdp.autosync(), PIPE | tile(0) | tmem(0));

        rdp.set_tile(&mut h.q, 1, RGBA, size::BPP16, 8, 0x100, 0);
        rdp.set_tile(&mut h.q, 0, RGBA, size::BPP16, 8, 0x80, 0);
        h.run().unwrap();

        assert_eq!(
            stream.opcodes(),
            vec![
                op::SET_TILE,
                op::TEXTURE_RECTANGLE,
                op::SET_TILE,
                op::SYNC_TILE,
                op::SET_TILE,
            ]
        );
    }

    #[test]
    fn reload_after_draw_inserts_sync_load() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_texture_image(&mut h.q, RGBA, size::BPP16, 32, 0x1000);
        rdp.set_tile(&mut h.q, 7, RGBA, size::BPP16, 0, 0, 0);
        rdp.load_block(&mut h.q, 7, 0, 0, 256, 0x800);
        rdp.set_tile(&mut h.q, 0, RGBA, size::BPP16, 8, 0, 0);
        rdp.texture_rectangle(&mut h.q, 0, 0.0, 0.0, 16.0, 16.0, 0.0, 0.0, 1.0, 1.0);
        rdp.load_block(&mut h.q, 7, 0, 0, 256, 0x800);
        h.run().unwrap();

        assert_eq!(
            stream.opcodes(),
            vec![
                op::SET_TEXTURE_IMAGE,
                op::SET_TILE,
                op::LOAD_BLOCK,
                op::SET_TILE,
                op::TEXTURE_RECTANGLE,
                op::SYNC_LOAD,
                op::LOAD_BLOCK,
            ]
        );
    }

    #[test]
    fn explicit_sync_clears_tracking() {
        let (mut h, mut rdp, stream) = setup();
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 4.0, 4.0);
        rdp.sync_pipe(&mut h.q);
        assert_eq!(rdp.autosync(), 0);
        rdp.set_other_modes(&mut h.q, 0);
        h.run().unwrap();

        let syncs = stream
            .opcodes()
            .iter()
            .filter(|&&o| o == op::SYNC_PIPE)
            .count();
        assert_eq!(syncs, 1);
    }

    #[test]
    fn disabled_autosync_is_not_inserted() {
        let (mut h, mut rdp, stream) = setup();
        assert_eq!(rdp.config_disable(CFG_AUTOSYNC_PIPE), CFG_DEFAULT);
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 4.0, 4.0);
        rdp.set_other_modes(&mut h.q, 0);
        h.run().unwrap();

        assert_eq!(stream.opcodes(), vec![op::FILL_RECTANGLE, op::SET_OTHER_MODES]);
        assert_eq!(rdp.config_enable(CFG_AUTOSYNC_PIPE), CFG_DEFAULT & !CFG_AUTOSYNC_PIPE);
        assert_eq!(rdp.config(), CFG_DEFAULT);
    }

    #[test]
    fn sync_full_is_delivered() {
        let (mut h, mut rdp, stream) = setup();
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 4.0, 4.0);
        rdp.sync_full(&mut h.q);
        assert_eq!(rdp.autosync(), 0);
        h.run().unwrap();
        assert_eq!(stream.full_syncs(), 1);
    }
}

// ============================================================================
// Static and dynamic encodings
// ============================================================================

mod encoding_tests {
    use super::*;

    const RECT: RdpCommand = encode::fill_rectangle(px(10), px(20), px(30), px(40));
    const TEXRECT: RdpCommand = encode::texture_rectangle(
        2,
        px(0),
        px(0),
        px(32),
        px(16),
        I27F5::from_bits(0),
        I27F5::from_bits(16),
        I22F10::from_bits(1024),
        I22F10::from_bits(512),
    );

    #[test]
    fn static_and_dynamic_paths_produce_same_stream() {
        let (mut h, mut rdp, stream) = setup();
        rdp.fill_rectangle(&mut h.q, 10.0, 20.0, 30.0, 40.0);
        rdp.texture_rectangle(&mut h.q, 2, 0.0, 0.0, 32.0, 16.0, 0.0, 0.5, 1.0, 0.5);
        rdp.set_other_modes(&mut h.q, 0xABCD);
        h.run().unwrap();
        let dynamic = stream.commands();
        stream.clear();

        let (mut h2, mut rdp2, stream2) = setup();
        rdp2.emit(&mut h2.q, &RECT);
        rdp2.emit(&mut h2.q, &TEXRECT);
        rdp2.emit(&mut h2.q, &encode::set_other_modes(0xABCD));
        h2.run().unwrap();

        assert_eq!(stream2.commands(), dynamic);
        assert_eq!(dynamic.len(), 1 + 2 + 2);
    }

    #[test]
    fn queue_word_carries_overlay_opcode() {
        let (mut h, mut rdp, _stream) = setup();
        rdp.fill_rectangle(&mut h.q, 1.0, 2.0, 3.0, 4.0);
        let ring = h.q.lowpri_ring();
        let word0 = h.mem.read(ring.base() + 4 * (ring.write_offset() - 2));
        assert_eq!(word0 >> 24, 0xF6);
        assert_eq!(word0 & 0x00FF_FFFF, (12 << 12) | 16);
    }

    #[test]
    fn coordinates_saturate() {
        let (mut h, mut rdp, stream) = setup();
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 1.0e9, 1.0e9);
        h.run().unwrap();
        assert_eq!(stream.commands().len(), 1);
    }
}

// ============================================================================
// Fixups
// ============================================================================

mod fixup_tests {
    use super::*;

    fn low(cmd: u64) -> u32 {
        cmd as u32
    }

    #[test]
    fn fill_color_follows_target_depth() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_color_image(&mut h.q, RGBA, size::BPP16, 320, 240, 0x10_0000);
        rdp.set_fill_color(&mut h.q, 0xFF00_00FF);
        h.run().unwrap();

        let cmds = stream.commands();
        assert_eq!(
            stream.opcodes(),
            vec![op::SET_COLOR_IMAGE, op::SET_FILL_COLOR, op::SET_SCISSOR, op::SET_FILL_COLOR]
        );
        assert_eq!(low(cmds[3]), 0xF801_F801);
    }

    #[test]
    fn fill_color_before_color_image_is_32bit() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_fill_color(&mut h.q, 0x1234_5678);
        h.run().unwrap();
        assert_eq!(stream.commands(), vec![((op::SET_FILL_COLOR as u64) << 56) | 0x1234_5678]);
    }

    #[test]
    fn new_color_image_reconverts_fill_color() {
        let (mut h, mut rdp, stream) = setup();
        rdp.config_disable(CFG_AUTOSCISSOR);
        rdp.set_fill_color(&mut h.q, 0x80FF_FFFF);
        rdp.set_color_image(&mut h.q, 2, size::BPP8, 320, 240, 0x10_0000);
        h.run().unwrap();

        let cmds = stream.commands();
        assert_eq!(cmds.len(), 3);
        assert_eq!(low(cmds[0]), 0x80FF_FFFF);
        assert_eq!(low(cmds[2]), 0x8080_8080);
    }

    #[test]
    fn fill_color_on_4bit_target_faults() {
        let (mut h, mut rdp, _stream) = setup();
        rdp.set_color_image(&mut h.q, 2, size::BPP4, 320, 240, 0x10_0000);
        rdp.set_fill_color(&mut h.q, 0);
        let err = h.run().unwrap_err();
        assert!(matches!(err, Fault::Overlay { command, .. } if command == op::SET_FILL_COLOR_32 as u16));
    }

    #[test]
    fn scissor_is_delivered_as_native_command() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_scissor(&mut h.q, 10.0, 20.0, 100.0, 200.0);
        h.run().unwrap();

        let expected = ((op::SET_SCISSOR as u64) << 56)
            | ((((40 << 12) | 80) as u64) << 32)
            | ((400 << 12) | 800) as u64;
        assert_eq!(stream.commands(), vec![expected]);
    }

    #[test]
    fn color_image_sets_full_target_scissor() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_color_image(&mut h.q, RGBA, size::BPP32, 64, 32, 0x10_0000);
        h.run().unwrap();

        let scissor = stream.commands()[2];
        assert_eq!(scissor >> 56, op::SET_SCISSOR as u64);
        assert_eq!(low(scissor), (256 << 12) | 128);
    }
}

// ============================================================================
// Blocks
// ============================================================================

mod block_tests {
    use super::*;

    #[test]
    fn block_records_and_restores_tracking() {
        let (mut h, mut rdp, stream) = setup();
        rdp.set_other_modes(&mut h.q, 0);
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 8.0, 8.0);
        assert_eq!(rdp.autosync(), PIPE);

        rdp.block_begin(&mut h.q);
        assert_eq!(rdp.autosync(), ALL);
        rdp.sync_full(&mut h.q);
        rdp.set_other_modes(&mut h.q, 1);
        rdp.fill_rectangle(&mut h.q, 0.0, 0.0, 8.0, 8.0);
        let block = rdp.block_end(&mut h.q);

        assert_eq!(block.rdp_tracking(), Some(PIPE));
        assert_eq!(rdp.autosync(), PIPE);

        rdp.block_run(&mut h.q, &block);
        assert_eq!(rdp.autosync(), PIPE);
        h.run().unwrap();
        assert_eq!(
            stream.opcodes(),
            vec![
                op::SET_OTHER_MODES,
                op::FILL_RECTANGLE,
                op::SYNC_FULL,
                op::SET_OTHER_MODES,
                op::FILL_RECTANGLE,
            ]
        );
    }

    #[test]
    fn block_starts_assuming_everything_in_use() {
        let (mut h, mut rdp, stream) = setup();
        rdp.block_begin(&mut h.q);
        rdp.set_tile(&mut h.q, 3, RGBA, size::BPP16, 8, 0, 0);
        let block = rdp.block_end(&mut h.q);
        rdp.block_run(&mut h.q, &block);
        h.run().unwrap();

        assert_eq!(stream.opcodes(), vec![op::SYNC_TILE, op::SET_TILE]);
        assert_eq!(block.rdp_tracking().map(|t| t & tile(3)), Some(0));
    }

    #[test]
    fn block_without_rasterizer_commands_leaves_everything_in_use() {
        let (mut h, mut rdp, stream) = setup();
        rdp.block_begin(&mut h.q);
        h.q.noop();
        let block = rdp.block_end(&mut h.q);
        assert_eq!(block.rdp_tracking(), None);
        assert_eq!(rdp.autosync(), 0);

        rdp.block_run(&mut h.q, &block);
        assert_eq!(rdp.autosync(), ALL);
        rdp.set_other_modes(&mut h.q, 0);
        h.run().unwrap();
        assert_eq!(stream.opcodes(), vec![op::SYNC_PIPE, op::SET_OTHER_MODES]);
    }

    #[test]
    fn close_unbinds_overlay() {
        let (mut h, rdp, _stream) = setup();
        assert!(h.q.registry().is_registered(RDP_OVERLAY_ID));
        rdp.close(&mut h.q);
        assert!(!h.q.registry().is_registered(RDP_OVERLAY_ID));
    }
}
