//! H.263 (短头) 图像头, 含 PLUSPTYPE 扩展格式

use bitflags::bitflags;
use log::{debug, trace};
use m4v_core::{BitCursor, M4vError, M4vResult};

use super::ensure_not_truncated;
use super::vop::PictureType;
use crate::tables::H263_SOURCE_FORMATS;

/// 图像起始码 (22 位)
const PICTURE_START_CODE: u32 = 0x20;
/// 扩展类型 PLUSPTYPE 的 source_format
const SOURCE_FORMAT_EXTENDED: u8 = 7;
/// PLUSPTYPE 中的自定义格式
const SOURCE_FORMAT_CUSTOM: u8 = 6;
/// PEI/PSUPP 循环的最大次数
const MAX_SUPPLEMENTAL_BYTES: usize = 256;

bitflags! {
    /// H.263 可选模式 (附录)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct H263Features: u16 {
        /// 附录 D: 无限制运动矢量
        const UNRESTRICTED_MV         = 1 << 0;
        /// 附录 E: 基于语法的算术编码
        const SYNTAX_ARITHMETIC       = 1 << 1;
        /// 附录 F: 高级预测
        const ADVANCED_PREDICTION     = 1 << 2;
        /// 附录 G/M: PB 帧
        const PB_FRAMES               = 1 << 3;
        /// 附录 I: 高级帧内编码
        const ADVANCED_INTRA          = 1 << 4;
        /// 附录 J: 去块滤波
        const DEBLOCKING              = 1 << 5;
        /// 附录 K: 条带结构
        const SLICE_STRUCTURED        = 1 << 6;
        /// 附录 N: 参考图像选择
        const REFERENCE_SELECTION     = 1 << 7;
        /// 附录 S: 独立分段解码
        const INDEPENDENT_SEGMENT     = 1 << 8;
        /// 附录 S: 替代 inter VLC
        const ALTERNATIVE_INTER_VLC   = 1 << 9;
        /// 附录 T: 修正量化
        const MODIFIED_QUANT          = 1 << 10;
        /// 附录 P: 参考图像重采样
        const REFERENCE_RESAMPLING    = 1 << 11;
        /// 附录 Q: 降分辨率更新
        const REDUCED_RESOLUTION      = 1 << 12;
    }
}

impl H263Features {
    /// 本解码器可处理的模式
    pub const SUPPORTED: Self = Self::UNRESTRICTED_MV
        .union(Self::ADVANCED_INTRA)
        .union(Self::DEBLOCKING)
        .union(Self::SLICE_STRUCTURED)
        .union(Self::MODIFIED_QUANT);
}

/// H.263 序列级参数
///
/// PLUSPTYPE 的 UFEP=0 图像沿用最近一次 UFEP=1 的参数.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeaderInfo {
    /// 1-5 为标准格式, 6 为自定义格式
    pub source_format: u8,
    /// 是否使用 PLUSPTYPE
    pub extended: bool,
    pub features: H263Features,
    /// 自定义图像时钟频率
    pub custom_pcf: bool,
    /// 连续存在多点模式 (CPM)
    pub cpm: bool,
    /// 自定义格式尺寸
    pub custom_size: Option<(u32, u32)>,
    /// 像素宽高比代码与扩展 PAR
    pub aspect_ratio: u8,
    pub par: Option<(u8, u8)>,
    /// 每个 GOB 的宏块行数
    pub rows_per_gob: u32,
}

impl ShortHeaderInfo {
    fn baseline(source_format: u8) -> Self {
        Self {
            source_format,
            extended: false,
            features: H263Features::empty(),
            custom_pcf: false,
            cpm: false,
            custom_size: None,
            aspect_ratio: 2,
            par: None,
            rows_per_gob: 1,
        }
    }

    /// GOB 数量
    pub fn gob_count(&self, mb_rows: usize) -> usize {
        mb_rows.div_ceil(self.rows_per_gob.max(1) as usize)
    }
}

/// 解析出的图像头
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShortPicture {
    pub info: ShortHeaderInfo,
    pub width: u32,
    pub height: u32,
    pub picture_type: PictureType,
    pub temporal_reference: u32,
    pub quant: u32,
    pub rounding_type: bool,
    /// CPM 下的子码流号
    pub psbi: Option<u8>,
}

/// 按图像高度确定每个 GOB 的宏块行数
pub(crate) fn rows_per_gob(height: u32) -> u32 {
    match height {
        0..=400 => 1,
        401..=800 => 2,
        _ => 4,
    }
}

fn check_features(features: H263Features) -> M4vResult<()> {
    let unsupported = features.difference(H263Features::SUPPORTED);
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(M4vError::Unsupported(format!("H.263 可选模式 {:?}", unsupported)))
    }
}

fn standard_size(source_format: u8) -> M4vResult<(u32, u32)> {
    match H263_SOURCE_FORMATS.get(usize::from(source_format)) {
        Some(&(width, height)) if width > 0 => Ok((width, height)),
        _ => Err(M4vError::InvalidData(format!(
            "无效 source_format {}",
            source_format
        ))),
    }
}

/// 解析 PLUSPTYPE 中的 OPPTYPE (18 位)
fn parse_opptype(cursor: &mut BitCursor) -> M4vResult<ShortHeaderInfo> {
    let source_format = cursor.read(3) as u8;
    let mut info = ShortHeaderInfo::baseline(source_format);
    info.extended = true;
    info.custom_pcf = cursor.read_flag();
    let flags = [
        H263Features::UNRESTRICTED_MV,
        H263Features::SYNTAX_ARITHMETIC,
        H263Features::ADVANCED_PREDICTION,
        H263Features::ADVANCED_INTRA,
        H263Features::DEBLOCKING,
        H263Features::SLICE_STRUCTURED,
        H263Features::REFERENCE_SELECTION,
        H263Features::INDEPENDENT_SEGMENT,
        H263Features::ALTERNATIVE_INTER_VLC,
        H263Features::MODIFIED_QUANT,
    ];
    for flag in flags {
        if cursor.read_flag() {
            info.features |= flag;
        }
    }
    let tail = cursor.read(4);
    if tail != 0b1000 {
        return Err(M4vError::InvalidData(format!("OPPTYPE 尾部 {:04b} 不是 1000", tail)));
    }
    if source_format == 0 || source_format == SOURCE_FORMAT_EXTENDED {
        return Err(M4vError::InvalidData(format!(
            "OPPTYPE source_format {} 无效",
            source_format
        )));
    }
    Ok(info)
}

/// 解析 MPPTYPE (9 位), 返回帧类型与舍入类型
fn parse_mpptype(
    cursor: &mut BitCursor,
    features: &mut H263Features,
) -> M4vResult<(PictureType, bool)> {
    let picture_code = cursor.read(3);
    if cursor.read_flag() {
        *features |= H263Features::REFERENCE_RESAMPLING;
    }
    if cursor.read_flag() {
        *features |= H263Features::REDUCED_RESOLUTION;
    }
    let rounding_type = cursor.read_flag();
    let tail = cursor.read(3);
    if tail != 0b001 {
        return Err(M4vError::InvalidData(format!("MPPTYPE 尾部 {:03b} 不是 001", tail)));
    }
    let picture_type = match picture_code {
        0 => PictureType::I,
        1 => PictureType::P,
        2 => {
            *features |= H263Features::PB_FRAMES;
            PictureType::P
        }
        other => {
            return Err(M4vError::Unsupported(format!("H.263 图像类型代码 {}", other)));
        }
    };
    Ok((picture_type, rounding_type))
}

/// 解析 H.263 图像头, 游标需位于图像起始码处
///
/// `previous` 为最近一次 UFEP=1 的扩展参数. 标志位异常等可恢复问题记入 `issues`.
pub(crate) fn parse_picture(
    cursor: &mut BitCursor,
    previous: Option<&ShortHeaderInfo>,
    issues: &mut Vec<String>,
) -> M4vResult<ShortPicture> {
    let psc = cursor.read(22);
    if psc != PICTURE_START_CODE {
        return Err(M4vError::InvalidData(format!("图像起始码不匹配: 0x{:06X}", psc)));
    }
    let temporal_reference = cursor.read(8);

    // PTYPE
    if cursor.read1() != 1 {
        issues.push("PTYPE 首位不是 1".into());
    }
    if cursor.read1() != 0 {
        return Err(M4vError::InvalidData("PTYPE 第 2 位不是 0 (H.261?)".into()));
    }
    let split_screen = cursor.read_flag();
    let document_camera = cursor.read_flag();
    let freeze_release = cursor.read_flag();
    if split_screen || document_camera || freeze_release {
        trace!(
            "PTYPE 显示提示: split={}, camera={}, freeze={}",
            split_screen, document_camera, freeze_release
        );
    }
    let source_format = cursor.read(3) as u8;

    if source_format != SOURCE_FORMAT_EXTENDED {
        parse_baseline(cursor, source_format, temporal_reference)
    } else {
        parse_extended(cursor, previous, temporal_reference, issues)
    }
}

/// 基本 PTYPE 的剩余部分
fn parse_baseline(
    cursor: &mut BitCursor,
    source_format: u8,
    temporal_reference: u32,
) -> M4vResult<ShortPicture> {
    let mut info = ShortHeaderInfo::baseline(source_format);
    let (width, height) = standard_size(source_format)?;
    let picture_type = if cursor.read_flag() {
        PictureType::P
    } else {
        PictureType::I
    };
    let flags = [
        H263Features::UNRESTRICTED_MV,
        H263Features::SYNTAX_ARITHMETIC,
        H263Features::ADVANCED_PREDICTION,
        H263Features::PB_FRAMES,
    ];
    for flag in flags {
        if cursor.read_flag() {
            info.features |= flag;
        }
    }
    check_features(info.features)?;
    let quant = cursor.read(5);
    info.cpm = cursor.read_flag();
    let psbi = info.cpm.then(|| cursor.read(2) as u8);
    info.rows_per_gob = rows_per_gob(height);
    finish_picture(
        cursor,
        ShortPicture {
            info,
            width,
            height,
            picture_type,
            temporal_reference,
            quant,
            rounding_type: false,
            psbi,
        },
    )
}

/// PLUSPTYPE 扩展格式
fn parse_extended(
    cursor: &mut BitCursor,
    previous: Option<&ShortHeaderInfo>,
    temporal_reference: u32,
    issues: &mut Vec<String>,
) -> M4vResult<ShortPicture> {
    let ufep = cursor.read(3);
    let mut info = match ufep {
        1 => parse_opptype(cursor)?,
        0 => match previous {
            Some(previous) => previous.clone(),
            None => {
                return Err(M4vError::InvalidData("UFEP=0 但没有可沿用的 OPPTYPE".into()));
            }
        },
        other => return Err(M4vError::InvalidData(format!("UFEP={} 无效", other))),
    };
    // MPPTYPE 中的模式按图像更新
    info.features.remove(
        H263Features::REFERENCE_RESAMPLING
            | H263Features::REDUCED_RESOLUTION
            | H263Features::PB_FRAMES,
    );
    let (picture_type, rounding_type) = parse_mpptype(cursor, &mut info.features)?;
    check_features(info.features)?;

    info.cpm = cursor.read_flag();
    let psbi = info.cpm.then(|| cursor.read(2) as u8);

    let (width, height) = if info.source_format == SOURCE_FORMAT_CUSTOM {
        if ufep == 1 {
            info.aspect_ratio = cursor.read(4) as u8;
            let pwi = cursor.read(9);
            if cursor.read1() != 1 {
                issues.push("CPFMT marker 位缺失".into());
            }
            let phi = cursor.read(9);
            if phi == 0 {
                return Err(M4vError::InvalidData("CPFMT 高度为 0".into()));
            }
            if info.aspect_ratio == 0xF {
                info.par = Some((cursor.read(8) as u8, cursor.read(8) as u8));
            }
            info.custom_size = Some(((pwi + 1) * 4, phi * 4));
        }
        info.custom_size
            .ok_or_else(|| M4vError::InvalidData("自定义格式缺少 CPFMT".into()))?
    } else {
        standard_size(info.source_format)?
    };

    if info.custom_pcf {
        if ufep == 1 {
            let clock_conversion = cursor.read1();
            let divisor = cursor.read(7);
            if divisor == 0 {
                issues.push("CPCFC 时钟除数为 0".into());
            }
            trace!("CPCFC: conversion={}, divisor={}", clock_conversion, divisor);
        }
        // ETR: 时间参考的高 2 位
        let extended_tr = cursor.read(2);
        trace!("ETR = {}", extended_tr);
    }
    if ufep == 1 && info.features.contains(H263Features::UNRESTRICTED_MV) && cursor.read1() == 0 {
        // UUI: `1` 或 `01`
        cursor.read1();
    }
    if ufep == 1 && info.features.contains(H263Features::SLICE_STRUCTURED) {
        let sss = cursor.read(2);
        if sss != 0 {
            return Err(M4vError::Unsupported(format!("矩形/任意顺序条带 SSS={:02b}", sss)));
        }
    }

    let quant = cursor.read(5);
    info.rows_per_gob = rows_per_gob(height);
    finish_picture(
        cursor,
        ShortPicture {
            info,
            width,
            height,
            picture_type,
            temporal_reference,
            quant,
            rounding_type,
            psbi,
        },
    )
}

/// 读取 PEI/PSUPP 并校验量化参数
fn finish_picture(cursor: &mut BitCursor, picture: ShortPicture) -> M4vResult<ShortPicture> {
    if picture.quant == 0 {
        return Err(M4vError::InvalidData("PQUANT 为 0".into()));
    }
    let mut supplemental = 0usize;
    while cursor.read_flag() {
        cursor.flush(8);
        supplemental += 1;
        if supplemental > MAX_SUPPLEMENTAL_BYTES {
            return Err(M4vError::InvalidData("PSUPP 过长".into()));
        }
    }
    ensure_not_truncated(cursor, "H.263 图像头")?;
    debug!(
        "H.263 图像: {:?} {}x{}, TR={}, PQUANT={}, 扩展={}, 模式 {:?}",
        picture.picture_type,
        picture.width,
        picture.height,
        picture.temporal_reference,
        picture.quant,
        picture.info.extended,
        picture.info.features
    );
    Ok(picture)
}
