//! 头部解析状态机.
//!
//! 状态流转: `SeekingSequence -> LayerConfigured -> { GOV? -> 帧头 -> (NotCoded | Coded) } -> ResyncUnit*`.
//!
//! - 层配置 (VOS/VO/VOL 或 H.263 图像头推导) 只解析一次, 遇到新的 VOL 起始码时重新配置.
//! - 帧头 (VOP 或 H.263 图像头) 每帧解析一次, `coded = false` 时帧内容等同参考帧.
//! - 同步单元头 (video packet / GOB / slice) 由帧解码循环驱动, 失配不是致命错误.

mod resync;
mod short_header;
mod vol;
mod vop;

#[cfg(test)]
mod tests;

use log::{debug, warn};
use m4v_core::{BitCursor, M4vError, M4vResult};

use crate::marker::{self, StartCode};
use crate::options::DecoderOptions;

pub use resync::{HeaderExtension, ResyncHeader, ResyncKind};
pub use short_header::{H263Features, ShortHeaderInfo};
pub use vol::{ComplexityEstimation, LayerConfig, QuantType, Scalability};
pub use vop::{FrameHeader, PictureType};

/// 起始码标识
pub const START_CODE_VOS: u8 = 0xB0;
pub const START_CODE_VOS_END: u8 = 0xB1;
pub const START_CODE_USER_DATA: u8 = 0xB2;
pub const START_CODE_GOV: u8 = 0xB3;
pub const START_CODE_VISUAL_OBJECT: u8 = 0xB5;
pub const START_CODE_VOP: u8 = 0xB6;
/// video object 起始码 0x00-0x1F
pub const START_CODE_VO_LAST: u8 = 0x1F;
/// VOL 起始码 0x20-0x2F, 低 4 位为层号
pub const START_CODE_VOL_FIRST: u8 = 0x20;
pub const START_CODE_VOL_LAST: u8 = 0x2F;

/// 解析器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// 等待序列/层起始码
    SeekingSequence,
    /// 层配置已就绪, 等待帧
    LayerConfigured,
    /// 已解析 GOV, 等待帧头
    GroupOfPictures,
    /// 当前帧未编码 (重复参考帧)
    NotCoded,
    /// 当前帧已编码, 位于首个同步单元
    Coded,
    /// 位于第 n 个同步单元 (从 1 开始)
    ResyncUnit(u32),
}

/// 时间基累计 (modulo_time_base 以秒为单位)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TimeBase {
    /// 最近一个 I/P 帧或 GOV 锚定的整秒数
    pub reference_seconds: u64,
}

/// 计算宏块编号字段宽度 `ceil(log2(total))`, 最少 1 位
pub fn mb_index_bits(total_mbs: usize) -> u32 {
    if total_mbs <= 1 {
        1
    } else {
        usize::BITS - (total_mbs - 1).leading_zeros()
    }
}

/// 读取 marker 位, 不为 1 时记录问题
pub(crate) fn expect_marker(cursor: &mut BitCursor, issues: &mut Vec<String>, what: &str) {
    if cursor.read1() != 1 {
        issues.push(format!("{} 处 marker 位缺失 (位 {})", what, cursor.position() - 1));
    }
}

/// 读取以 0 结尾的连续 1 的个数 (modulo_time_base)
pub(crate) fn read_unary_ones(cursor: &mut BitCursor, limit: u32) -> M4vResult<u32> {
    let mut count = 0u32;
    while cursor.read1() == 1 {
        count += 1;
        if count > limit || cursor.at_end() {
            return Err(M4vError::InvalidData(format!(
                "modulo_time_base 过长: {} 位",
                count
            )));
        }
    }
    Ok(count)
}

/// 解析结束后检查是否读过缓冲区末尾
pub(crate) fn ensure_not_truncated(cursor: &BitCursor, what: &str) -> M4vResult<()> {
    if cursor.position() > cursor.end_pos() * 8 {
        return Err(M4vError::InvalidData(format!(
            "{} 截断: 位置 {} 超过末尾 {}",
            what,
            cursor.position(),
            cursor.end_pos() * 8
        )));
    }
    Ok(())
}

/// 头部解析器
///
/// 每个解码层持有一个实例. 层配置与当前帧头由解析器保存, 供系数重建与帧解码读取.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    options: DecoderOptions,
    state: ParserState,
    /// 0 为基本层, 非 0 为增强层
    layer_index: usize,
    /// VOS 中的 profile_and_level_indication
    profile_level: Option<u8>,
    layer: Option<LayerConfig>,
    frame: Option<FrameHeader>,
    time: TimeBase,
    /// 最近一次 UFEP=1 时的扩展图像类型, 供 UFEP=0 复用
    plus_state: Option<ShortHeaderInfo>,
    /// 当前头部累计的可恢复问题
    issues: Vec<String>,
}

impl HeaderParser {
    /// 创建解析器
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            options,
            state: ParserState::SeekingSequence,
            layer_index: 0,
            profile_level: None,
            layer: None,
            frame: None,
            time: TimeBase::default(),
            plus_state: None,
            issues: Vec::new(),
        }
    }

    /// 当前状态
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// 当前层配置
    pub fn layer(&self) -> Option<&LayerConfig> {
        self.layer.as_ref()
    }

    /// 当前帧头
    pub fn frame(&self) -> Option<&FrameHeader> {
        self.frame.as_ref()
    }

    /// VOS 中的 profile/level
    pub fn profile_level(&self) -> Option<u8> {
        self.profile_level
    }

    /// 解析选项
    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// 回到初始状态 (丢弃层配置)
    pub fn reset(&mut self) {
        *self = Self::new(self.options.clone());
    }

    /// 将累计问题转换为结果
    ///
    /// 容错模式下返回 `RecoverableHeader`, 否则返回 `InvalidData`.
    fn take_issues(&mut self, what: &str) -> M4vResult<()> {
        if self.issues.is_empty() {
            return Ok(());
        }
        let detail = format!("{}: {}", what, self.issues.join("; "));
        self.issues.clear();
        if self.options.tolerant {
            warn!("{}", detail);
            Err(M4vError::RecoverableHeader(detail))
        } else {
            Err(M4vError::InvalidData(detail))
        }
    }

    /// 解析序列/层配置
    ///
    /// 从游标当前位置起查找 VOS/VO/VOL 起始码, 解析完 VOL 后进入 `LayerConfigured`.
    /// 若先遇到 H.263 图像起始码, 则由图像头推导层配置, 游标回退到起始码处, 以便随后按帧解析.
    /// `layer_index` 为 0 表示基本层, 非 0 表示增强层, 两者接受的 profile 不同.
    ///
    /// 容错模式下层头部存在可恢复问题时, 配置照常生效但返回 `RecoverableHeader`.
    pub fn parse_configuration(
        &mut self,
        cursor: &mut BitCursor,
        layer_index: usize,
    ) -> M4vResult<&LayerConfig> {
        self.issues.clear();
        self.layer_index = layer_index;
        loop {
            match marker::seek_start_code(cursor)? {
                StartCode::ShortHeader => {
                    let start = cursor.position();
                    let picture = short_header::parse_picture(cursor, None, &mut self.issues)?;
                    cursor.seek(start);
                    self.issues.clear();
                    let layer = LayerConfig::from_short_header(&picture);
                    debug!(
                        "H.263 短头层配置: {}x{}, 源格式 {}",
                        layer.width, layer.height, picture.info.source_format
                    );
                    return Ok(self.install_layer(layer));
                }
                StartCode::Mpeg4(START_CODE_VOS) => {
                    cursor.flush(32);
                    let profile = cursor.read(8) as u8;
                    vol::check_profile(profile, layer_index)?;
                    debug!("VOS profile_and_level = 0x{:02X}", profile);
                    self.profile_level = Some(profile);
                }
                StartCode::Mpeg4(START_CODE_VISUAL_OBJECT) => {
                    cursor.flush(32);
                    vol::parse_visual_object(cursor)?;
                }
                StartCode::Mpeg4(code @ START_CODE_VOL_FIRST..=START_CODE_VOL_LAST) => {
                    cursor.flush(32);
                    let layer = vol::parse_vol(
                        cursor,
                        code & 0x0F,
                        layer_index,
                        self.profile_level,
                        &mut self.issues,
                    )?;
                    if let Err(err) = self.take_issues("VOL") {
                        if !err.is_failure() {
                            self.install_layer(layer);
                        }
                        return Err(err);
                    }
                    return Ok(self.install_layer(layer));
                }
                StartCode::Mpeg4(code) => {
                    // VO 起始码, 用户数据, 以及配置前出现的帧级起始码
                    if code > START_CODE_VO_LAST && code != START_CODE_USER_DATA {
                        debug!("配置前跳过起始码 0x{:02X}", code);
                    }
                    cursor.flush(32);
                }
            }
        }
    }

    fn install_layer(&mut self, layer: LayerConfig) -> &LayerConfig {
        self.state = ParserState::LayerConfigured;
        self.frame = None;
        self.layer.insert(layer)
    }

    /// 解析下一帧的帧头
    ///
    /// 途经的 GOV 头更新时间锚点, 途经的 VOL 头重新配置当前层.
    /// 遇到序列结束码或缓冲区耗尽时返回 `EndOfUnit`.
    pub fn parse_frame(&mut self, cursor: &mut BitCursor) -> M4vResult<FrameHeader> {
        if self.layer.is_none() {
            return Err(M4vError::InvalidArgument("尚未解析层配置".into()));
        }
        loop {
            let code = marker::seek_start_code(cursor)?;
            let short_header = self
                .layer
                .as_ref()
                .is_some_and(|layer| layer.short_header.is_some());
            match code {
                StartCode::ShortHeader if short_header => {
                    return self.parse_short_header_frame(cursor);
                }
                StartCode::ShortHeader => {
                    // MPEG-4 码流中字节对齐的 resync marker 也会呈现 00 00 8x
                    cursor.flush(16);
                }
                StartCode::Mpeg4(START_CODE_GOV) => {
                    cursor.flush(32);
                    let seconds = vop::parse_gov(cursor)?;
                    self.time.reference_seconds = seconds;
                    self.state = ParserState::GroupOfPictures;
                }
                StartCode::Mpeg4(START_CODE_VOP) => {
                    cursor.flush(32);
                    let Some(layer) = self.layer.as_ref() else {
                        return Err(M4vError::InvalidArgument("尚未解析层配置".into()));
                    };
                    let frame = vop::parse_vop(cursor, layer, &mut self.time)?;
                    self.state = if frame.coded {
                        ParserState::Coded
                    } else {
                        ParserState::NotCoded
                    };
                    self.frame = Some(frame.clone());
                    return Ok(frame);
                }
                StartCode::Mpeg4(START_CODE_VOL_FIRST..=START_CODE_VOL_LAST) => {
                    let layer_index = self.layer_index;
                    match self.parse_configuration(cursor, layer_index) {
                        Ok(_) => {}
                        Err(err) if !err.is_failure() => {}
                        Err(err) => return Err(err),
                    }
                }
                StartCode::Mpeg4(START_CODE_VOS_END) => {
                    cursor.flush(32);
                    self.state = ParserState::SeekingSequence;
                    return Err(M4vError::EndOfUnit);
                }
                StartCode::Mpeg4(_) => cursor.flush(32),
            }
        }
    }

    fn parse_short_header_frame(&mut self, cursor: &mut BitCursor) -> M4vResult<FrameHeader> {
        let picture =
            short_header::parse_picture(cursor, self.plus_state.as_ref(), &mut self.issues)?;
        for issue in self.issues.drain(..) {
            warn!("H.263 图像头: {}", issue);
        }
        if picture.info.extended {
            self.plus_state = Some(picture.info.clone());
        }
        if let Some(layer) = self.layer.as_mut() {
            if layer.display_width != picture.width || layer.display_height != picture.height {
                debug!(
                    "H.263 尺寸变化: {}x{} -> {}x{}",
                    layer.display_width, layer.display_height, picture.width, picture.height
                );
                layer.set_dimensions(picture.width, picture.height);
            }
            layer.short_header = Some(picture.info.clone());
        }
        let frame = FrameHeader::from_short_header(&picture);
        self.state = ParserState::Coded;
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    /// 当前帧的同步标记长度
    pub fn resync_marker_len(&self) -> u32 {
        match (&self.layer, &self.frame) {
            (Some(layer), _) if layer.short_header.is_some() => marker::GOB_MARKER_LEN,
            (_, Some(frame)) => frame.resync_marker_len(),
            _ => 17,
        }
    }
}
