//! VOS / VO / VOL 头部解析

use log::debug;
use m4v_core::{BitCursor, M4vError, M4vResult};

use super::short_header::ShortPicture;
use super::{ShortHeaderInfo, ensure_not_truncated, expect_marker, mb_index_bits};
use crate::tables::{DEFAULT_INTER_MATRIX, DEFAULT_INTRA_MATRIX, ZIGZAG_SCAN};

/// 基本层接受的 profile_and_level (Simple / Simple Scalable / Core)
const BASE_LAYER_PROFILES: &[u8] = &[
    0x01, 0x02, 0x03, 0x04, 0x05, 0x08, 0x10, 0x11, 0x12, 0x21, 0x22,
];

/// 增强层只接受 Simple Scalable
const ENHANCEMENT_LAYER_PROFILES: &[u8] = &[0x10, 0x11, 0x12];

/// 反量化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
    /// H.263 算术反量化
    Arithmetic,
    /// MPEG 矩阵反量化
    Matrix,
}

/// 复杂度估计定义, 只用于在帧头中跳过对应位数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComplexityEstimation {
    pub method: u8,
    /// I/P/B 帧头中需跳过的位数
    pub bits_i: u32,
    pub bits_p: u32,
    pub bits_b: u32,
}

/// 可伸缩性参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scalability {
    /// 0 = 空间, 1 = 时间
    pub hierarchy_type: u8,
    pub ref_layer_id: u8,
    pub ref_layer_sampling_direct: bool,
    pub hor_sampling_factor_n: u8,
    pub hor_sampling_factor_m: u8,
    pub vert_sampling_factor_n: u8,
    pub vert_sampling_factor_m: u8,
    pub enhancement_type: bool,
}

/// 层配置
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    /// VOL 起始码中的层号
    pub layer_id: u8,
    pub profile_level: Option<u8>,
    pub object_type: u8,
    pub verid: u8,
    /// H.263 短头模式参数
    pub short_header: Option<ShortHeaderInfo>,
    /// 像素宽高比 (aspect_ratio_info, 扩展 PAR)
    pub aspect_ratio: u8,
    pub par: Option<(u8, u8)>,
    pub low_delay: bool,
    pub time_increment_resolution: u32,
    /// vop_time_increment 字段宽度
    pub time_increment_bits: u32,
    pub fixed_vop_time_increment: Option<u32>,
    /// 码流声明的尺寸
    pub display_width: u32,
    pub display_height: u32,
    /// 向上取整到 16 的尺寸
    pub width: u32,
    pub height: u32,
    pub mb_cols: usize,
    pub mb_rows: usize,
    pub total_mbs: usize,
    /// 同步单元头中宏块编号字段宽度
    pub mb_number_bits: u32,
    pub obmc_disable: bool,
    pub quant_precision: u32,
    pub quant_type: QuantType,
    /// 光栅顺序的量化矩阵
    pub intra_matrix: [u8; 64],
    pub inter_matrix: [u8; 64],
    pub complexity: Option<ComplexityEstimation>,
    pub resync_marker_disable: bool,
    pub data_partitioned: bool,
    pub reversible_vlc: bool,
    pub scalability: Option<Scalability>,
}

impl LayerConfig {
    pub(crate) fn with_defaults(layer_id: u8) -> Self {
        Self {
            layer_id,
            profile_level: None,
            object_type: 1,
            verid: 1,
            short_header: None,
            aspect_ratio: 1,
            par: None,
            low_delay: false,
            time_increment_resolution: 30000,
            time_increment_bits: 15,
            fixed_vop_time_increment: None,
            display_width: 0,
            display_height: 0,
            width: 0,
            height: 0,
            mb_cols: 0,
            mb_rows: 0,
            total_mbs: 0,
            mb_number_bits: 1,
            obmc_disable: true,
            quant_precision: 5,
            quant_type: QuantType::Arithmetic,
            intra_matrix: DEFAULT_INTRA_MATRIX,
            inter_matrix: DEFAULT_INTER_MATRIX,
            complexity: None,
            resync_marker_disable: false,
            data_partitioned: false,
            reversible_vlc: false,
            scalability: None,
        }
    }

    /// 由 H.263 图像头推导层配置
    pub(crate) fn from_short_header(picture: &ShortPicture) -> Self {
        let mut layer = Self::with_defaults(0);
        layer.short_header = Some(picture.info.clone());
        layer.set_dimensions(picture.width, picture.height);
        layer
    }

    /// 设置尺寸并重新计算宏块网格与编号位宽
    pub(crate) fn set_dimensions(&mut self, width: u32, height: u32) {
        self.display_width = width;
        self.display_height = height;
        self.width = width.div_ceil(16) * 16;
        self.height = height.div_ceil(16) * 16;
        self.mb_cols = (self.width / 16) as usize;
        self.mb_rows = (self.height / 16) as usize;
        self.total_mbs = self.mb_cols * self.mb_rows;
        self.mb_number_bits = mb_index_bits(self.total_mbs);
    }

    /// 是否启用错误恢复工具 (resync marker)
    pub fn error_resilient(&self) -> bool {
        !self.resync_marker_disable
    }
}

/// 按层序号检查 profile_and_level 白名单
pub(crate) fn check_profile(profile: u8, layer_index: usize) -> M4vResult<()> {
    let accepted = if layer_index == 0 {
        BASE_LAYER_PROFILES
    } else {
        ENHANCEMENT_LAYER_PROFILES
    };
    if accepted.contains(&profile) {
        Ok(())
    } else {
        Err(M4vError::Unsupported(format!(
            "层 {} 不支持 profile_and_level 0x{:02X}",
            layer_index, profile
        )))
    }
}

/// 解析 visual object 头 (0xB5 之后)
pub(crate) fn parse_visual_object(cursor: &mut BitCursor) -> M4vResult<()> {
    if cursor.read_flag() {
        let verid = cursor.read(4);
        let priority = cursor.read(3);
        debug!("visual object: verid={}, priority={}", verid, priority);
    }
    let object_type = cursor.read(4);
    if object_type != 1 {
        return Err(M4vError::Unsupported(format!(
            "visual_object_type={} 不是视频",
            object_type
        )));
    }
    if cursor.read_flag() {
        let _video_format = cursor.read(3);
        let _full_range = cursor.read1();
        if cursor.read_flag() {
            let _colour_primaries = cursor.read(8);
            let _transfer = cursor.read(8);
            let _matrix = cursor.read(8);
        }
    }
    ensure_not_truncated(cursor, "visual object 头")
}

/// 时间增量字段宽度: 表示 `resolution - 1` 所需位数, 至少 1 位
pub(crate) fn time_increment_bits(resolution: u32) -> u32 {
    if resolution <= 1 {
        1
    } else {
        (u32::BITS - (resolution - 1).leading_zeros()).max(1)
    }
}

/// 读取自定义量化矩阵
///
/// 按之字形顺序逐项读取, 遇到 0 终止, 其余项重复最后一个显式值.
/// 首项即为 0 时保留默认矩阵并记录问题.
fn read_quant_matrix(
    cursor: &mut BitCursor,
    default: &[u8; 64],
    issues: &mut Vec<String>,
    what: &str,
) -> [u8; 64] {
    let mut matrix = *default;
    let mut count = 0usize;
    let mut last = 0u8;
    while count < 64 {
        let value = cursor.read(8) as u8;
        if value == 0 {
            break;
        }
        matrix[ZIGZAG_SCAN[count]] = value;
        last = value;
        count += 1;
    }
    if count == 0 {
        issues.push(format!("{} 量化矩阵首项为 0", what));
        return *default;
    }
    for &pos in &ZIGZAG_SCAN[count..] {
        matrix[pos] = last;
    }
    matrix
}

/// 读取使能位, 置位时计入 `bits` 位
fn optional_bits(cursor: &mut BitCursor, bits: u32) -> u32 {
    if cursor.read_flag() { bits } else { 0 }
}

/// 解析复杂度估计定义, 计算各帧类型需跳过的位数
fn parse_complexity_estimation(
    cursor: &mut BitCursor,
    issues: &mut Vec<String>,
) -> ComplexityEstimation {
    let method = cursor.read(2) as u8;
    let mut estimation = ComplexityEstimation {
        method,
        ..Default::default()
    };
    if method > 1 {
        issues.push(format!("未知的复杂度估计方法 {}", method));
        return estimation;
    }

    let mut i = 0u32;
    let mut p = 0u32;
    let mut b = 0u32;
    // 形状复杂度: opaque, transparent, intra_cae, inter_cae, no_update, upsampling
    if !cursor.read_flag() {
        for _ in 0..6 {
            i += optional_bits(cursor, 8);
        }
    }
    // 纹理集 1: intra_blocks, inter_blocks, inter4v_blocks, not_coded_blocks
    if !cursor.read_flag() {
        i += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
        i += optional_bits(cursor, 8);
    }
    expect_marker(cursor, issues, "复杂度估计");
    // 纹理集 2: dct_coefs, dct_lines, vlc_symbols, vlc_bits
    if !cursor.read_flag() {
        i += optional_bits(cursor, 8);
        i += optional_bits(cursor, 8);
        i += optional_bits(cursor, 8);
        i += optional_bits(cursor, 4);
    }
    // 运动补偿: apm, npm, interpolate_mc_q, forw_back_mc_q, halfpel2, halfpel4
    if !cursor.read_flag() {
        p += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
        b += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
    }
    expect_marker(cursor, issues, "复杂度估计");
    // 版本 2: sadct, quarterpel
    if method == 1 && !cursor.read_flag() {
        i += optional_bits(cursor, 8);
        p += optional_bits(cursor, 8);
    }

    estimation.bits_i = i;
    estimation.bits_p = i + p;
    estimation.bits_b = i + p + b;
    estimation
}

fn parse_scalability(cursor: &mut BitCursor) -> M4vResult<Scalability> {
    let scalability = Scalability {
        hierarchy_type: cursor.read1() as u8,
        ref_layer_id: cursor.read(4) as u8,
        ref_layer_sampling_direct: cursor.read_flag(),
        hor_sampling_factor_n: cursor.read(5) as u8,
        hor_sampling_factor_m: cursor.read(5) as u8,
        vert_sampling_factor_n: cursor.read(5) as u8,
        vert_sampling_factor_m: cursor.read(5) as u8,
        enhancement_type: cursor.read_flag(),
    };
    if scalability.hor_sampling_factor_m == 0 || scalability.vert_sampling_factor_m == 0 {
        return Err(M4vError::InvalidData("可伸缩性采样因子分母为 0".into()));
    }
    Ok(scalability)
}

/// 解析 VOL 头 (起始码之后)
///
/// 不支持的特性 (非矩形形状、隔行、sprite 等) 与语义错误直接失败;
/// marker 位缺失等可恢复问题记入 `issues`, 由调用方按容错模式处理.
pub(crate) fn parse_vol(
    cursor: &mut BitCursor,
    layer_id: u8,
    layer_index: usize,
    profile_level: Option<u8>,
    issues: &mut Vec<String>,
) -> M4vResult<LayerConfig> {
    let mut layer = LayerConfig::with_defaults(layer_id);
    layer.profile_level = profile_level;

    let _random_accessible_vol = cursor.read1();
    layer.object_type = cursor.read(8) as u8;
    if cursor.read_flag() {
        layer.verid = cursor.read(4) as u8;
        let _priority = cursor.read(3);
    }

    layer.aspect_ratio = cursor.read(4) as u8;
    match layer.aspect_ratio {
        0 => issues.push("aspect_ratio_info=0 为禁用值".into()),
        0xF => {
            let par_w = cursor.read(8) as u8;
            let par_h = cursor.read(8) as u8;
            if par_w == 0 || par_h == 0 {
                issues.push(format!("扩展 PAR 含 0: {}:{}", par_w, par_h));
            }
            layer.par = Some((par_w, par_h));
        }
        _ => {}
    }

    if cursor.read_flag() {
        let chroma_format = cursor.read(2);
        if chroma_format != 1 {
            return Err(M4vError::Unsupported(format!(
                "chroma_format={} 不是 4:2:0",
                chroma_format
            )));
        }
        layer.low_delay = cursor.read_flag();
        if cursor.read_flag() {
            // VBV 参数: 码率/缓冲区/占用量, 共 79 位
            cursor.flush(15);
            expect_marker(cursor, issues, "VBV first_half_bit_rate");
            cursor.flush(15);
            expect_marker(cursor, issues, "VBV latter_half_bit_rate");
            cursor.flush(15);
            expect_marker(cursor, issues, "VBV first_half_vbv_buffer_size");
            cursor.flush(3 + 11);
            expect_marker(cursor, issues, "VBV first_half_vbv_occupancy");
            cursor.flush(15);
            expect_marker(cursor, issues, "VBV latter_half_vbv_occupancy");
        }
    }

    let shape = cursor.read(2);
    if shape != 0 {
        return Err(M4vError::Unsupported(format!(
            "video_object_layer_shape={} 非矩形",
            shape
        )));
    }

    expect_marker(cursor, issues, "time_increment_resolution 前");
    layer.time_increment_resolution = cursor.read(16);
    if layer.time_increment_resolution == 0 {
        return Err(M4vError::InvalidData("vop_time_increment_resolution 为 0".into()));
    }
    layer.time_increment_bits = time_increment_bits(layer.time_increment_resolution);
    expect_marker(cursor, issues, "time_increment_resolution 后");
    if cursor.read_flag() {
        layer.fixed_vop_time_increment = Some(cursor.read(layer.time_increment_bits));
    }

    expect_marker(cursor, issues, "宽度前");
    let width = cursor.read(13);
    expect_marker(cursor, issues, "宽度后");
    let height = cursor.read(13);
    expect_marker(cursor, issues, "高度后");
    if width == 0 || height == 0 {
        return Err(M4vError::InvalidData(format!("无效尺寸 {}x{}", width, height)));
    }
    layer.set_dimensions(width, height);

    if cursor.read_flag() {
        return Err(M4vError::Unsupported("隔行扫描".into()));
    }
    layer.obmc_disable = cursor.read_flag();
    if !layer.obmc_disable {
        issues.push("obmc_disable=0".into());
    }

    let sprite_enable = if layer.verid == 1 {
        cursor.read(1)
    } else {
        cursor.read(2)
    };
    if sprite_enable != 0 {
        return Err(M4vError::Unsupported(format!("sprite_enable={}", sprite_enable)));
    }

    if cursor.read_flag() {
        layer.quant_precision = cursor.read(4);
        let bits_per_pixel = cursor.read(4);
        if bits_per_pixel != 8 {
            return Err(M4vError::Unsupported(format!(
                "bits_per_pixel={}",
                bits_per_pixel
            )));
        }
        if !(3..=9).contains(&layer.quant_precision) {
            return Err(M4vError::InvalidData(format!(
                "quant_precision={} 超出范围",
                layer.quant_precision
            )));
        }
    }

    if cursor.read_flag() {
        layer.quant_type = QuantType::Matrix;
        if cursor.read_flag() {
            layer.intra_matrix = read_quant_matrix(cursor, &DEFAULT_INTRA_MATRIX, issues, "intra");
        }
        if cursor.read_flag() {
            layer.inter_matrix = read_quant_matrix(cursor, &DEFAULT_INTER_MATRIX, issues, "inter");
        }
    }

    if layer.verid != 1 && cursor.read_flag() {
        return Err(M4vError::Unsupported("quarter_sample".into()));
    }

    if !cursor.read_flag() {
        layer.complexity = Some(parse_complexity_estimation(cursor, issues));
    }

    layer.resync_marker_disable = cursor.read_flag();
    layer.data_partitioned = cursor.read_flag();
    if layer.data_partitioned {
        layer.reversible_vlc = cursor.read_flag();
    }

    if layer.verid != 1 {
        if cursor.read_flag() {
            return Err(M4vError::Unsupported("newpred".into()));
        }
        if cursor.read_flag() {
            return Err(M4vError::Unsupported("reduced_resolution_vop".into()));
        }
    }

    if cursor.read_flag() {
        layer.scalability = Some(parse_scalability(cursor)?);
    }
    if layer_index > 0 && layer.scalability.is_none() {
        return Err(M4vError::InvalidData("增强层缺少可伸缩性参数".into()));
    }

    ensure_not_truncated(cursor, "VOL 头")?;

    debug!(
        "VOL: 层 {} {}x{} ({}x{} 宏块), 时间分辨率 {}, 量化 {:?}, 分区 {}, RVLC {}, resync {}",
        layer.layer_id,
        layer.display_width,
        layer.display_height,
        layer.mb_cols,
        layer.mb_rows,
        layer.time_increment_resolution,
        layer.quant_type,
        layer.data_partitioned,
        layer.reversible_vlc,
        layer.error_resilient()
    );
    Ok(layer)
}
