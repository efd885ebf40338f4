use m4v_core::bitwriter::BitWriter;
use m4v_core::{BitCursor, M4vError, M4vResult};

use super::*;
use crate::tables::{DEFAULT_INTRA_MATRIX, ZIGZAG_SCAN};
use crate::test_support::{VolParams, stream, write_vol, write_vop, write_vos};

fn configured(data: &[u8], options: DecoderOptions) -> (HeaderParser, BitCursor<'_>) {
    let mut parser = HeaderParser::new(options);
    let mut cursor = BitCursor::new(data);
    parser
        .parse_configuration(&mut cursor, 0)
        .expect("层配置解析应成功");
    (parser, cursor)
}

fn tolerant() -> DecoderOptions {
    DecoderOptions {
        tolerant: true,
        ..Default::default()
    }
}

#[test]
fn test_mb_index_bits() {
    assert_eq!(mb_index_bits(0), 1);
    assert_eq!(mb_index_bits(1), 1);
    assert_eq!(mb_index_bits(2), 1);
    assert_eq!(mb_index_bits(99), 7);
    assert_eq!(mb_index_bits(128), 7);
    assert_eq!(mb_index_bits(129), 8);
    assert_eq!(mb_index_bits(396), 9);
}

#[test]
fn test_profile_accepted_for_base_layer_only() {
    let data = stream(|bw| {
        write_vos(bw, 0x01);
        write_vol(bw, &VolParams::default());
    });

    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&data);
    assert!(parser.parse_configuration(&mut cursor, 0).is_ok());
    assert_eq!(parser.profile_level(), Some(0x01));
    assert_eq!(parser.state(), ParserState::LayerConfigured);

    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&data);
    let err = parser.parse_configuration(&mut cursor, 1).unwrap_err();
    assert!(matches!(err, M4vError::Unsupported(_)), "增强层不接受 0x01: {err:?}");
    assert!(parser.layer().is_none());
}

#[test]
fn test_enhancement_layer_requires_scalability() {
    let plain = stream(|bw| {
        write_vos(bw, 0x11);
        write_vol(bw, &VolParams::default());
    });
    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&plain);
    let err = parser.parse_configuration(&mut cursor, 1).unwrap_err();
    assert!(matches!(err, M4vError::InvalidData(_)));

    let scalable = stream(|bw| {
        write_vos(bw, 0x11);
        write_vol(
            bw,
            &VolParams {
                scalability: true,
                ..Default::default()
            },
        );
    });
    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&scalable);
    let layer = parser.parse_configuration(&mut cursor, 1).unwrap();
    let scalability = layer.scalability.expect("应解析可伸缩性参数");
    assert_eq!(scalability.hierarchy_type, 1);
    assert_eq!(scalability.hor_sampling_factor_m, 1);
}

#[test]
fn test_vol_dimensions_rounded_to_macroblocks() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                width: 100,
                height: 50,
                ..Default::default()
            },
        );
    });
    let (parser, _) = configured(&data, DecoderOptions::default());
    let layer = parser.layer().unwrap();
    assert_eq!((layer.display_width, layer.display_height), (100, 50));
    assert_eq!((layer.width, layer.height), (112, 64));
    assert_eq!((layer.mb_cols, layer.mb_rows), (7, 4));
    assert_eq!(layer.total_mbs, 28);
    assert_eq!(layer.mb_number_bits, 5);
    assert_eq!(layer.time_increment_bits, 5);
    assert!(layer.error_resilient());
}

#[test]
fn test_custom_intra_matrix_repeats_last_value() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                intra_matrix: Some(vec![10, 20, 30, 0]),
                ..Default::default()
            },
        );
    });
    let (parser, _) = configured(&data, DecoderOptions::default());
    let layer = parser.layer().unwrap();
    assert_eq!(layer.quant_type, QuantType::Matrix);
    assert_eq!(layer.intra_matrix[ZIGZAG_SCAN[0]], 10);
    assert_eq!(layer.intra_matrix[ZIGZAG_SCAN[1]], 20);
    for &pos in &ZIGZAG_SCAN[2..] {
        assert_eq!(layer.intra_matrix[pos], 30, "位置 {pos} 应重复最后一个值");
    }
}

#[test]
fn test_leading_zero_matrix_keeps_default() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                intra_matrix: Some(vec![0]),
                ..Default::default()
            },
        );
    });

    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&data);
    let err = parser.parse_configuration(&mut cursor, 0).unwrap_err();
    assert!(matches!(err, M4vError::InvalidData(_)), "严格模式应失败");
    assert!(parser.layer().is_none());

    let mut parser = HeaderParser::new(tolerant());
    let mut cursor = BitCursor::new(&data);
    let err = parser.parse_configuration(&mut cursor, 0).unwrap_err();
    assert!(matches!(err, M4vError::RecoverableHeader(_)));
    let layer = parser.layer().expect("容错模式下配置仍生效");
    assert_eq!(layer.intra_matrix, DEFAULT_INTRA_MATRIX);
}

#[test]
fn test_forbidden_aspect_ratio_is_recoverable() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                aspect: 0,
                ..Default::default()
            },
        );
    });
    let mut parser = HeaderParser::new(tolerant());
    let mut cursor = BitCursor::new(&data);
    let result = parser.parse_configuration(&mut cursor, 0).map(|_| ());
    assert_eq!(m4v_core::Status::of(&result), m4v_core::Status::RecoverableHeaderIssue);
    assert_eq!(parser.state(), ParserState::LayerConfigured);
}

#[test]
fn test_zero_time_resolution_fails() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                time_resolution: 0,
                ..Default::default()
            },
        );
    });
    let mut parser = HeaderParser::new(tolerant());
    let mut cursor = BitCursor::new(&data);
    let err = parser.parse_configuration(&mut cursor, 0).unwrap_err();
    assert!(err.is_failure());
}

#[test]
fn test_complexity_estimation_skipped_in_vop() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(
            bw,
            &VolParams {
                complexity: true,
                ..Default::default()
            },
        );
        bw.write_start_code(START_CODE_VOP);
        bw.write_bits(1, 2); // P
        bw.write_unary_ones(0);
        bw.write_marker();
        bw.write_bits(3, 5);
        bw.write_marker();
        bw.write_bits(1, 1); // coded
        bw.write_bits(1, 1); // rounding
        bw.write_bits(0xFFFF_FFFF, 32); // 复杂度估计数据
        bw.write_bits(2, 3); // intra_dc_vlc_thr
        bw.write_bits(9, 5);
        bw.write_bits(2, 3);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let complexity = parser.layer().unwrap().complexity.unwrap();
    assert_eq!(complexity.bits_i, 16);
    assert_eq!(complexity.bits_p, 32);
    assert_eq!(complexity.bits_b, 32);

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.picture_type, PictureType::P);
    assert!(frame.rounding_type);
    assert_eq!(frame.intra_dc_vlc_thr, 2);
    assert_eq!(frame.quant, 9);
    assert_eq!(frame.fcode_forward, 2);
}

#[test]
fn test_vop_zero_quant_fails() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 0, 0, true, 0, 1);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let err = parser.parse_frame(&mut cursor).unwrap_err();
    assert!(matches!(err, M4vError::InvalidData(_)));
}

#[test]
fn test_not_coded_vop() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 1, 0, false, 0, 1);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert!(!frame.coded);
    assert_eq!(frame.time_increment, 7);
    assert_eq!(parser.state(), ParserState::NotCoded);
}

#[test]
fn test_gov_anchors_time_base() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        bw.write_start_code(START_CODE_GOV);
        bw.write_bits(1, 5);
        bw.write_bits(2, 6);
        bw.write_marker();
        bw.write_bits(3, 6);
        bw.write_bits(1, 1);
        bw.write_bits(0, 1);
        write_vop(bw, 0, 1, true, 4, 1);
        write_vop(bw, 2, 1, true, 4, 1);
        write_vop(bw, 1, 0, true, 4, 1);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.seconds, 3724);
    assert_eq!(frame.timestamp_ticks(30), 3724 * 30 + 7);

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.picture_type, PictureType::B);
    assert_eq!(frame.seconds, 3725, "B 帧不更新时间锚点");

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.seconds, 3724);

    assert_eq!(parser.parse_frame(&mut cursor), Err(M4vError::EndOfUnit));
}

#[test]
fn test_gov_out_of_range() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        bw.write_start_code(START_CODE_GOV);
        bw.write_bits(0, 5);
        bw.write_bits(60, 6);
        bw.write_marker();
        bw.write_bits(0, 6);
        bw.write_bits(0, 2);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    assert!(matches!(
        parser.parse_frame(&mut cursor),
        Err(M4vError::InvalidData(_))
    ));
}

#[test]
fn test_resync_marker_length_per_picture_type() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 0, 0, true, 4, 0);
        write_vop(bw, 1, 0, true, 4, 3);
        write_vop(bw, 2, 0, true, 4, 1);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let expected = [17, 19, 18];
    for len in expected {
        parser.parse_frame(&mut cursor).unwrap();
        assert_eq!(parser.resync_marker_len(), len);
    }
}

#[test]
fn test_video_packet_header() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 0, 0, true, 8, 0);
        bw.write_bits(0b10110, 5); // 宏块数据
        bw.write_stuffing();
        bw.write_bits(1, 17);
        bw.write_bits(33, 7);
        bw.write_bits(10, 5);
        bw.write_bits(0, 1); // HEC
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    assert!(!parser.check_resync_marker(&mut cursor));
    cursor.flush(5);
    assert!(parser.check_resync_marker(&mut cursor));

    let header = parser.parse_resync_header(&mut cursor).unwrap();
    assert_eq!(header.mb_number, 33);
    assert_eq!(header.quant, 10);
    assert_eq!(header.kind, ResyncKind::VideoPacket { extension: None });
    assert_eq!(parser.state(), ParserState::ResyncUnit(1));

    assert_eq!(
        parser.parse_resync_header(&mut cursor),
        Err(M4vError::EndOfUnit),
        "数据耗尽应为单元结束"
    );
}

#[test]
fn test_video_packet_extension_type_mismatch() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 0, 0, true, 8, 0);
        bw.write_stuffing();
        bw.write_bits(1, 17);
        bw.write_bits(5, 7);
        bw.write_bits(10, 5);
        bw.write_bits(1, 1); // HEC
        bw.write_unary_ones(0);
        bw.write_marker();
        bw.write_bits(7, 5);
        bw.write_marker();
        bw.write_bits(1, 2); // P, 与帧头不一致
        bw.write_bits(0, 3);
        bw.write_bits(1, 3);
        bw.write_bits(0xFFFF, 16);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    assert!(matches!(
        parser.parse_resync_header(&mut cursor),
        Err(M4vError::InvalidData(_))
    ));
}

/// 帧类型 `vop_code`、fcode 均为 `fcode` 的帧, 后接带 HEC 的 video packet
///
/// `fields` 写入 HEC 中帧类型之后的字段 (dc_thr 与 fcode).
fn hec_packet(vop_code: u32, fcode: u32, fields: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
    let marker_len = match vop_code {
        0 => 17,
        1 => 16 + fcode,
        _ => 16 + fcode.max(2),
    };
    stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, vop_code, 0, true, 8, fcode);
        bw.write_stuffing();
        bw.write_bits(1, marker_len);
        bw.write_bits(5, 7);
        bw.write_bits(10, 5);
        bw.write_bits(1, 1); // HEC
        bw.write_unary_ones(0);
        bw.write_marker();
        bw.write_bits(7, 5);
        bw.write_marker();
        bw.write_bits(vop_code, 2);
        fields(bw);
        bw.write_bits(0xFFFF, 16);
    })
}

fn parse_hec_packet(data: &[u8]) -> M4vResult<ResyncHeader> {
    let (mut parser, mut cursor) = configured(data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    parser.parse_resync_header(&mut cursor)
}

#[test]
fn test_video_packet_extension_matches_frame() {
    let data = hec_packet(1, 2, |bw| {
        bw.write_bits(0, 3);
        bw.write_bits(2, 3);
    });
    let header = parse_hec_packet(&data).unwrap();
    let ResyncKind::VideoPacket { extension: Some(extension) } = header.kind else {
        panic!("应解析出 HEC: {:?}", header.kind);
    };
    assert_eq!(extension.picture_type, PictureType::P);
    assert_eq!(extension.time_increment, 7);
    assert_eq!(extension.fcode_forward, 2);
}

#[test]
fn test_video_packet_extension_dc_threshold_mismatch() {
    let data = hec_packet(0, 1, |bw| bw.write_bits(5, 3));
    assert!(
        matches!(parse_hec_packet(&data), Err(M4vError::InvalidData(_))),
        "HEC intra_dc_vlc_thr 与帧头不一致应失败"
    );
}

#[test]
fn test_video_packet_extension_forward_fcode_mismatch() {
    let data = hec_packet(1, 2, |bw| {
        bw.write_bits(0, 3);
        bw.write_bits(3, 3);
    });
    assert!(matches!(parse_hec_packet(&data), Err(M4vError::InvalidData(_))));
}

#[test]
fn test_video_packet_extension_zero_fcode_rejected() {
    let data = hec_packet(1, 1, |bw| {
        bw.write_bits(0, 3);
        bw.write_bits(0, 3);
    });
    assert!(
        matches!(parse_hec_packet(&data), Err(M4vError::InvalidData(_))),
        "HEC fcode 为 0 非法"
    );
}

#[test]
fn test_video_packet_extension_backward_fcode_mismatch() {
    let data = hec_packet(2, 1, |bw| {
        bw.write_bits(0, 3);
        bw.write_bits(1, 3);
        bw.write_bits(4, 3);
    });
    assert!(matches!(parse_hec_packet(&data), Err(M4vError::InvalidData(_))));

    let data = hec_packet(2, 1, |bw| {
        bw.write_bits(0, 3);
        bw.write_bits(1, 3);
        bw.write_bits(1, 3);
    });
    assert!(parse_hec_packet(&data).is_ok(), "与帧头一致的 B 帧 HEC 应通过");
}

#[test]
fn test_video_packet_wrong_pattern_fails() {
    let data = stream(|bw| {
        write_vos(bw, 0x03);
        write_vol(bw, &VolParams::default());
        write_vop(bw, 0, 0, true, 8, 0);
        bw.write_bits(0xABCD_1234, 32);
        bw.write_bits(0x5678, 16);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    assert!(matches!(
        parser.parse_resync_header(&mut cursor),
        Err(M4vError::InvalidData(_))
    ));
}

/// 基本 H.263 图像头 (50 位)
fn write_h263_picture(bw: &mut BitWriter, source_format: u32, p_picture: bool, sac: bool, quant: u32) {
    bw.write_bits(0x20, 22);
    bw.write_bits(5, 8); // TR
    bw.write_bits(0b10, 2);
    bw.write_bits(0, 3);
    bw.write_bits(source_format, 3);
    bw.write_flag(p_picture);
    bw.write_bits(0, 1); // UMV
    bw.write_flag(sac);
    bw.write_bits(0, 2); // AP, PB
    bw.write_bits(quant, 5);
    bw.write_bits(0, 1); // CPM
    bw.write_bits(0, 1); // PEI
}

/// PLUSPTYPE 图像头, UFEP=1
fn write_h263_plus_picture(
    bw: &mut BitWriter,
    source_format: u32,
    slices: bool,
    custom_size: Option<(u32, u32)>,
) {
    bw.write_bits(0x20, 22);
    bw.write_bits(9, 8);
    bw.write_bits(0b10, 2);
    bw.write_bits(0, 3);
    bw.write_bits(7, 3);
    bw.write_bits(1, 3); // UFEP
    bw.write_bits(source_format, 3);
    bw.write_bits(0, 1); // custom PCF
    bw.write_bits(0, 5); // UMV SAC AP AIC DF
    bw.write_flag(slices);
    bw.write_bits(0, 4); // RPS ISD AIV MQ
    bw.write_bits(0b1000, 4);
    bw.write_bits(0, 3); // I
    bw.write_bits(0, 3); // RPR RRU RTYPE
    bw.write_bits(0b001, 3);
    bw.write_bits(0, 1); // CPM
    if let Some((width, height)) = custom_size {
        bw.write_bits(2, 4);
        bw.write_bits(width / 4 - 1, 9);
        bw.write_marker();
        bw.write_bits(height / 4, 9);
    }
    if slices {
        bw.write_bits(0, 2); // SSS
    }
    bw.write_bits(6, 5);
    bw.write_bits(0, 1);
}

#[test]
fn test_h263_standard_format() {
    let data = stream(|bw| write_h263_picture(bw, 2, false, false, 7));
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let layer = parser.layer().unwrap();
    assert_eq!((layer.width, layer.height), (176, 144));
    assert_eq!(layer.total_mbs, 99);
    assert_eq!(layer.short_header.as_ref().unwrap().rows_per_gob, 1);
    assert_eq!(cursor.position(), 0, "配置解析后应回到图像起始码");

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert!(frame.short_header);
    assert_eq!(frame.picture_type, PictureType::I);
    assert_eq!(frame.quant, 7);
    assert_eq!(frame.temporal_reference, Some(5));
    assert!(!frame.use_intra_dc_vlc(1));
    assert_eq!(cursor.position(), 50);
}

#[test]
fn test_h263_unsupported_mode() {
    let data = stream(|bw| write_h263_picture(bw, 2, true, true, 7));
    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&data);
    let err = parser.parse_configuration(&mut cursor, 0).unwrap_err();
    assert!(matches!(err, M4vError::Unsupported(_)));
}

#[test]
fn test_h263_plus_custom_format() {
    let data = stream(|bw| write_h263_plus_picture(bw, 6, false, Some((320, 240))));
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let layer = parser.layer().unwrap();
    assert_eq!((layer.width, layer.height), (320, 240));
    assert_eq!((layer.mb_cols, layer.mb_rows), (20, 15));
    let info = layer.short_header.as_ref().unwrap();
    assert!(info.extended);
    assert_eq!(info.custom_size, Some((320, 240)));

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.quant, 6);
    assert_eq!(frame.temporal_reference, Some(9));
}

#[test]
fn test_gob_header() {
    let data = stream(|bw| {
        write_h263_picture(bw, 2, true, false, 7);
        bw.write_bits(0b101101, 6);
        bw.write_bits(1, 17);
        bw.write_bits(3, 5); // GN
        bw.write_bits(2, 2); // GFID
        bw.write_bits(12, 5);
        bw.write_bits(0b1011, 4);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.picture_type, PictureType::P);
    cursor.flush(6);
    assert!(parser.check_resync_marker(&mut cursor));
    let header = parser.parse_resync_header(&mut cursor).unwrap();
    assert_eq!(header.mb_number, 33);
    assert_eq!(header.quant, 12);
    assert_eq!(header.kind, ResyncKind::Gob { number: 3, frame_id: 2 });
}

#[test]
fn test_gob_header_next_picture_is_end_of_unit() {
    let data = stream(|bw| {
        write_h263_picture(bw, 2, false, false, 7);
        bw.align_zero();
        write_h263_picture(bw, 2, true, false, 7);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    let before = cursor.position();
    assert_eq!(parser.parse_resync_header(&mut cursor), Err(M4vError::EndOfUnit));
    assert_eq!(cursor.position(), before, "遇到 PSC 后游标应回退");

    let frame = parser.parse_frame(&mut cursor).unwrap();
    assert_eq!(frame.picture_type, PictureType::P);
}

#[test]
fn test_slice_header() {
    let data = stream(|bw| {
        write_h263_plus_picture(bw, 2, true, None);
        bw.write_bits(1, 17);
        bw.write_bits(1, 1); // SEPB1
        bw.write_bits(22, 7); // MBA
        bw.write_bits(9, 5);
        bw.write_marker(); // SEPB3
        bw.write_bits(1, 2);
        bw.write_bits(0b1111, 4);
    });
    let (mut parser, mut cursor) = configured(&data, DecoderOptions::default());
    parser.parse_frame(&mut cursor).unwrap();
    let header = parser.parse_resync_header(&mut cursor).unwrap();
    assert_eq!(header.mb_number, 22);
    assert_eq!(header.quant, 9);
    assert_eq!(header.kind, ResyncKind::Slice { frame_id: 1 });
}

#[test]
fn test_frame_before_configuration_rejected() {
    let data = stream(|bw| write_vop(bw, 0, 0, true, 4, 0));
    let mut parser = HeaderParser::new(DecoderOptions::default());
    let mut cursor = BitCursor::new(&data);
    assert!(matches!(
        parser.parse_frame(&mut cursor),
        Err(M4vError::InvalidArgument(_))
    ));
}
