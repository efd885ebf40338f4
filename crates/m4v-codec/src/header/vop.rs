//! GOV / VOP 帧头

use log::{debug, trace};
use m4v_core::{BitCursor, M4vError, M4vResult};

use super::short_header::ShortPicture;
use super::vol::LayerConfig;
use super::{TimeBase, ensure_not_truncated, read_unary_ones};
use crate::marker::GOB_MARKER_LEN;

/// intra DC 改用 AC 表编码的量化阈值, 下标为 `intra_dc_vlc_thr`
const INTRA_DC_VLC_THRESHOLD: [u32; 8] = [32, 13, 15, 17, 19, 21, 23, 0];

/// modulo_time_base 允许的最大秒数
const MAX_MODULO_TIME_BASE: u32 = 3600;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    I,
    P,
    B,
}

impl PictureType {
    fn from_vop_code(code: u32) -> M4vResult<Self> {
        match code {
            0 => Ok(Self::I),
            1 => Ok(Self::P),
            2 => Ok(Self::B),
            _ => Err(M4vError::Unsupported("S-VOP (sprite)".into())),
        }
    }

    /// 是否为帧内编码帧
    pub fn is_intra(self) -> bool {
        self == Self::I
    }
}

/// 帧头参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub picture_type: PictureType,
    pub modulo_time_base: u32,
    pub time_increment: u32,
    /// 累计整秒数
    pub seconds: u64,
    /// 为 false 时本帧与参考帧相同
    pub coded: bool,
    pub rounding_type: bool,
    pub intra_dc_vlc_thr: u8,
    pub quant: u32,
    pub fcode_forward: u8,
    pub fcode_backward: u8,
    pub ref_select_code: Option<u8>,
    /// H.263 时间参考 (TR)
    pub temporal_reference: Option<u32>,
    pub short_header: bool,
    /// H.263 Annex I 高级帧内编码
    pub advanced_intra: bool,
}

impl FrameHeader {
    pub(crate) fn empty(picture_type: PictureType) -> Self {
        Self {
            picture_type,
            modulo_time_base: 0,
            time_increment: 0,
            seconds: 0,
            coded: true,
            rounding_type: false,
            intra_dc_vlc_thr: 0,
            quant: 0,
            fcode_forward: 1,
            fcode_backward: 1,
            ref_select_code: None,
            temporal_reference: None,
            short_header: false,
            advanced_intra: false,
        }
    }

    /// 由 H.263 图像头构造帧头
    pub(crate) fn from_short_header(picture: &ShortPicture) -> Self {
        Self {
            quant: picture.quant,
            rounding_type: picture.rounding_type,
            temporal_reference: Some(picture.temporal_reference),
            short_header: true,
            advanced_intra: picture
                .info
                .features
                .contains(super::H263Features::ADVANCED_INTRA),
            ..Self::empty(picture.picture_type)
        }
    }

    /// resync marker 长度: I 帧 17 位, P 帧 16 + fcode, B 帧 16 + max(fcode_f, fcode_b, 2)
    pub fn resync_marker_len(&self) -> u32 {
        if self.short_header {
            return GOB_MARKER_LEN;
        }
        let fcode_f = u32::from(self.fcode_forward);
        let fcode_b = u32::from(self.fcode_backward);
        match self.picture_type {
            PictureType::I => 17,
            PictureType::P => 16 + fcode_f,
            PictureType::B => 16 + fcode_f.max(fcode_b).max(2),
        }
    }

    /// 在量化参数 `qp` 下 intra DC 是否使用独立的 DC VLC
    ///
    /// 短头模式下 DC 始终为 8 位定长码, 返回 false.
    pub fn use_intra_dc_vlc(&self, qp: u32) -> bool {
        !self.short_header && qp < INTRA_DC_VLC_THRESHOLD[usize::from(self.intra_dc_vlc_thr & 7)]
    }

    /// 以 `resolution` 为单位的时间戳
    pub fn timestamp_ticks(&self, resolution: u32) -> u64 {
        self.seconds * u64::from(resolution) + u64::from(self.time_increment)
    }
}

/// 解析 GOV 头 (起始码之后), 返回时间码对应的秒数
pub(crate) fn parse_gov(cursor: &mut BitCursor) -> M4vResult<u64> {
    let hours = cursor.read(5);
    let minutes = cursor.read(6);
    let marker = cursor.read1();
    let seconds = cursor.read(6);
    let closed = cursor.read_flag();
    let broken_link = cursor.read_flag();
    ensure_not_truncated(cursor, "GOV 头")?;
    if marker != 1 {
        return Err(M4vError::InvalidData("GOV 时间码 marker 位缺失".into()));
    }
    if hours > 23 || minutes > 59 || seconds > 59 {
        return Err(M4vError::InvalidData(format!(
            "GOV 时间码越界: {:02}:{:02}:{:02}",
            hours, minutes, seconds
        )));
    }
    debug!(
        "GOV {:02}:{:02}:{:02}, closed={}, broken_link={}",
        hours, minutes, seconds, closed, broken_link
    );
    Ok(u64::from(hours * 3600 + minutes * 60 + seconds))
}

fn require_marker(cursor: &mut BitCursor, what: &str) -> M4vResult<()> {
    if cursor.read1() != 1 {
        return Err(M4vError::InvalidData(format!("VOP {} marker 位缺失", what)));
    }
    Ok(())
}

pub(crate) fn read_fcode(cursor: &mut BitCursor, what: &str) -> M4vResult<u8> {
    let fcode = cursor.read(3) as u8;
    if fcode == 0 {
        return Err(M4vError::InvalidData(format!("{} 为 0", what)));
    }
    Ok(fcode)
}

/// 解析 VOP 头 (起始码之后)
pub(crate) fn parse_vop(
    cursor: &mut BitCursor,
    layer: &LayerConfig,
    time: &mut TimeBase,
) -> M4vResult<FrameHeader> {
    let picture_type = PictureType::from_vop_code(cursor.read(2))?;
    let mut frame = FrameHeader::empty(picture_type);

    frame.modulo_time_base = read_unary_ones(cursor, MAX_MODULO_TIME_BASE)?;
    require_marker(cursor, "time_increment 前")?;
    frame.time_increment = cursor.read(layer.time_increment_bits);
    require_marker(cursor, "time_increment 后")?;

    frame.seconds = time.reference_seconds + u64::from(frame.modulo_time_base);
    if picture_type != PictureType::B {
        time.reference_seconds = frame.seconds;
    }

    frame.coded = cursor.read_flag();
    if !frame.coded {
        ensure_not_truncated(cursor, "VOP 头")?;
        debug!("VOP {:?} 未编码, t={}s+{}", picture_type, frame.seconds, frame.time_increment);
        return Ok(frame);
    }

    if picture_type == PictureType::P {
        frame.rounding_type = cursor.read_flag();
    }

    if let Some(complexity) = &layer.complexity {
        let bits = match picture_type {
            PictureType::I => complexity.bits_i,
            PictureType::P => complexity.bits_p,
            PictureType::B => complexity.bits_b,
        };
        trace!("跳过复杂度估计 {} 位", bits);
        cursor.flush(bits as usize);
    }

    frame.intra_dc_vlc_thr = cursor.read(3) as u8;
    frame.quant = cursor.read(layer.quant_precision);
    if frame.quant == 0 {
        return Err(M4vError::InvalidData("vop_quant 为 0".into()));
    }
    if picture_type != PictureType::I {
        frame.fcode_forward = read_fcode(cursor, "vop_fcode_forward")?;
    }
    if picture_type == PictureType::B {
        frame.fcode_backward = read_fcode(cursor, "vop_fcode_backward")?;
    }
    if layer.scalability.is_some() {
        frame.ref_select_code = Some(cursor.read(2) as u8);
    }

    ensure_not_truncated(cursor, "VOP 头")?;
    debug!(
        "VOP {:?}: t={}s+{}, quant={}, fcode={}/{}, dc_thr={}",
        picture_type,
        frame.seconds,
        frame.time_increment,
        frame.quant,
        frame.fcode_forward,
        frame.fcode_backward,
        frame.intra_dc_vlc_thr
    );
    Ok(frame)
}
