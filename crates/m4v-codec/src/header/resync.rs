//! 同步单元头: MPEG-4 video packet, H.263 GOB 与条带

use log::{debug, trace};
use m4v_core::{BitCursor, M4vError, M4vResult};

use super::vop::{FrameHeader, PictureType, read_fcode};
use super::vol::LayerConfig;
use super::{H263Features, HeaderParser, ParserState, read_unary_ones};
use crate::marker::GOB_MARKER_LEN;

/// GOB 编号 31 表示序列结束 (EOS)
const GOB_NUMBER_EOS: u32 = 31;
/// 条带 MBA 宽度超过该值时插入 SEPB2
const SLICE_MBA_SPLIT_BITS: u32 = 11;

/// video packet 头中的冗余帧头 (HEC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderExtension {
    pub modulo_time_base: u32,
    pub time_increment: u32,
    pub picture_type: PictureType,
    pub intra_dc_vlc_thr: u8,
    pub fcode_forward: u8,
    pub fcode_backward: u8,
}

/// 同步单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncKind {
    VideoPacket { extension: Option<HeaderExtension> },
    Gob { number: u32, frame_id: u8 },
    Slice { frame_id: u8 },
}

/// 同步单元头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncHeader {
    /// 单元内第一个宏块的光栅序号
    pub mb_number: usize,
    pub quant: u32,
    pub kind: ResyncKind,
}

fn require_marker(cursor: &mut BitCursor, what: &str) -> M4vResult<()> {
    if cursor.read1() != 1 {
        return Err(M4vError::InvalidData(format!("{} marker 位缺失", what)));
    }
    Ok(())
}

impl HeaderParser {
    /// 游标处是否为同步标记
    ///
    /// MPEG-4 要求标记前有合法的强制填充位; H.263 接受未对齐的 GBSC/SSC,
    /// 或经零填充/填充位对齐后的标记.
    pub fn check_resync_marker(&self, cursor: &mut BitCursor) -> bool {
        let short_header = self
            .layer
            .as_ref()
            .is_some_and(|layer| layer.short_header.is_some());
        if short_header {
            cursor.peek(GOB_MARKER_LEN) == 1
                || cursor.peek_byte_aligned(GOB_MARKER_LEN, false) == Some(1)
        } else {
            cursor.peek_byte_aligned(self.resync_marker_len(), true) == Some(1)
        }
    }

    /// 解析同步单元头
    ///
    /// 成功时状态进入下一个 `ResyncUnit`. 数据耗尽、遇到起始码或下一图像的 PSC 时返回
    /// `EndOfUnit` (游标停在起始码处); 其他不匹配的位模式返回 `InvalidData`.
    pub fn parse_resync_header(&mut self, cursor: &mut BitCursor) -> M4vResult<ResyncHeader> {
        self.parse_resync(cursor, false)
    }

    /// 游标位于字节对齐的同步标记起点 (由搜索定位) 时解析同步单元头
    ///
    /// 与 [`parse_resync_header`](Self::parse_resync_header) 相同, 但不检查标记前的填充位.
    pub fn parse_resync_header_at_marker(
        &mut self,
        cursor: &mut BitCursor,
    ) -> M4vResult<ResyncHeader> {
        self.parse_resync(cursor, true)
    }

    fn parse_resync(&mut self, cursor: &mut BitCursor, at_marker: bool) -> M4vResult<ResyncHeader> {
        let (Some(layer), Some(frame)) = (self.layer.as_ref(), self.frame.as_ref()) else {
            return Err(M4vError::InvalidArgument("尚未解析层配置与帧头".into()));
        };
        let start = cursor.position();
        let header = if let Some(info) = layer.short_header.as_ref() {
            let slices = info.features.contains(H263Features::SLICE_STRUCTURED);
            if !self.check_resync_marker(cursor) {
                return Err(resync_mismatch(cursor, GOB_MARKER_LEN));
            }
            if cursor.peek(GOB_MARKER_LEN) != 1 {
                cursor.byte_align(false);
            }
            cursor.flush(GOB_MARKER_LEN as usize);
            let parsed = if slices {
                parse_slice_header(cursor, layer, info.cpm)
            } else {
                parse_gob_header(cursor, layer, info.cpm, info.rows_per_gob)
            };
            if parsed == Err(M4vError::EndOfUnit) {
                // 下一图像的 PSC 或序列结束码, 交还给帧头解析
                cursor.seek(start);
            }
            parsed?
        } else {
            let marker_len = frame.resync_marker_len();
            if at_marker {
                if cursor.peek(marker_len) != 1 {
                    return Err(resync_mismatch(cursor, marker_len));
                }
            } else if !self.check_resync_marker(cursor) {
                return Err(resync_mismatch(cursor, marker_len));
            } else {
                cursor.byte_align(true);
            }
            cursor.flush(marker_len as usize);
            parse_video_packet_header(cursor, layer, frame)?
        };

        let unit = match self.state {
            ParserState::ResyncUnit(n) => n + 1,
            _ => 1,
        };
        self.state = ParserState::ResyncUnit(unit);
        trace!(
            "同步单元 {}: 宏块 {}, quant {}, {:?}",
            unit, header.mb_number, header.quant, header.kind
        );
        Ok(header)
    }
}

/// 标记不匹配时区分单元结束与数据错误
fn resync_mismatch(cursor: &mut BitCursor, marker_len: u32) -> M4vError {
    if cursor.bits_left() < marker_len as usize {
        return M4vError::EndOfUnit;
    }
    let at_start_code = cursor.peek_byte_aligned(24, false) == Some(1)
        || cursor.peek_byte_aligned(24, true) == Some(1);
    if at_start_code {
        return M4vError::EndOfUnit;
    }
    M4vError::InvalidData(format!("位 {} 处不是同步标记", cursor.position()))
}

/// HEC 中的冗余字段必须与帧头一致
fn check_extension_field(what: &str, extension: u8, frame: u8) -> M4vResult<()> {
    if extension != frame {
        return Err(M4vError::InvalidData(format!(
            "HEC {} = {} 与帧头 {} 不一致",
            what, extension, frame
        )));
    }
    Ok(())
}

fn parse_video_packet_header(
    cursor: &mut BitCursor,
    layer: &LayerConfig,
    frame: &FrameHeader,
) -> M4vResult<ResyncHeader> {
    let mb_number = cursor.read(layer.mb_number_bits) as usize;
    if mb_number >= layer.total_mbs {
        return Err(M4vError::InvalidData(format!(
            "video packet 宏块号 {} 超出 {}",
            mb_number, layer.total_mbs
        )));
    }
    let quant = cursor.read(layer.quant_precision);
    if quant == 0 {
        return Err(M4vError::InvalidData("video packet quant_scale 为 0".into()));
    }

    let extension = if cursor.read_flag() {
        let modulo_time_base = read_unary_ones(cursor, 3600)?;
        require_marker(cursor, "HEC time_increment 前")?;
        let time_increment = cursor.read(layer.time_increment_bits);
        require_marker(cursor, "HEC time_increment 后")?;
        let picture_type = match cursor.read(2) {
            0 => PictureType::I,
            1 => PictureType::P,
            2 => PictureType::B,
            other => {
                return Err(M4vError::InvalidData(format!("HEC 帧类型代码 {}", other)));
            }
        };
        if picture_type != frame.picture_type {
            return Err(M4vError::InvalidData(format!(
                "HEC 帧类型 {:?} 与帧头 {:?} 不一致",
                picture_type, frame.picture_type
            )));
        }
        let intra_dc_vlc_thr = cursor.read(3) as u8;
        check_extension_field("intra_dc_vlc_thr", intra_dc_vlc_thr, frame.intra_dc_vlc_thr)?;
        let fcode_forward = if picture_type != PictureType::I {
            read_fcode(cursor, "HEC vop_fcode_forward")?
        } else {
            frame.fcode_forward
        };
        check_extension_field("vop_fcode_forward", fcode_forward, frame.fcode_forward)?;
        let fcode_backward = if picture_type == PictureType::B {
            read_fcode(cursor, "HEC vop_fcode_backward")?
        } else {
            frame.fcode_backward
        };
        check_extension_field("vop_fcode_backward", fcode_backward, frame.fcode_backward)?;
        debug!(
            "HEC: modulo={}, time_increment={}, dc_thr={}",
            modulo_time_base, time_increment, intra_dc_vlc_thr
        );
        Some(HeaderExtension {
            modulo_time_base,
            time_increment,
            picture_type,
            intra_dc_vlc_thr,
            fcode_forward,
            fcode_backward,
        })
    } else {
        None
    };

    Ok(ResyncHeader {
        mb_number,
        quant,
        kind: ResyncKind::VideoPacket { extension },
    })
}

fn parse_gob_header(
    cursor: &mut BitCursor,
    layer: &LayerConfig,
    cpm: bool,
    rows_per_gob: u32,
) -> M4vResult<ResyncHeader> {
    let number = cursor.read(5);
    if number == 0 || number == GOB_NUMBER_EOS {
        return Err(M4vError::EndOfUnit);
    }
    let first_row = number as usize * rows_per_gob as usize;
    if first_row >= layer.mb_rows {
        return Err(M4vError::InvalidData(format!(
            "GOB 编号 {} 超出 {} 行宏块",
            number, layer.mb_rows
        )));
    }
    if cpm {
        let _gsbi = cursor.read(2);
    }
    let frame_id = cursor.read(2) as u8;
    let quant = cursor.read(5);
    if quant == 0 {
        return Err(M4vError::InvalidData("GQUANT 为 0".into()));
    }
    Ok(ResyncHeader {
        mb_number: first_row * layer.mb_cols,
        quant,
        kind: ResyncKind::Gob { number, frame_id },
    })
}

fn parse_slice_header(
    cursor: &mut BitCursor,
    layer: &LayerConfig,
    cpm: bool,
) -> M4vResult<ResyncHeader> {
    // SEPB1 为 0 时实为 PSC
    if cursor.read1() != 1 {
        return Err(M4vError::EndOfUnit);
    }
    if cpm {
        let _ssbi = cursor.read(4);
    }
    let mb_number = cursor.read(layer.mb_number_bits) as usize;
    if layer.mb_number_bits > SLICE_MBA_SPLIT_BITS {
        require_marker(cursor, "SEPB2")?;
    }
    if mb_number >= layer.total_mbs {
        return Err(M4vError::InvalidData(format!(
            "条带 MBA {} 超出 {}",
            mb_number, layer.total_mbs
        )));
    }
    let quant = cursor.read(5);
    if quant == 0 {
        return Err(M4vError::InvalidData("SQUANT 为 0".into()));
    }
    require_marker(cursor, "SEPB3")?;
    let frame_id = cursor.read(2) as u8;
    Ok(ResyncHeader {
        mb_number,
        quant,
        kind: ResyncKind::Slice { frame_id },
    })
}
