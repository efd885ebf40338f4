//! 熵解码接口.
//!
//! VLC 码表与符号解码由外部实现提供, 本模块只定义符号形式与解码策略.
//! 策略按帧选定一次 ([`BlockDecodePlan`]), 之后每个系数直接按策略分派.

use m4v_core::{BitCursor, M4vResult};

use crate::context::MacroblockMode;
use crate::header::{FrameHeader, LayerConfig};

/// 系数符号 `(run, level, sign, last)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLevel {
    /// 本系数前的零系数个数
    pub run: u8,
    /// 幅值 (> 0)
    pub level: i32,
    /// 为 true 时系数为负
    pub sign: bool,
    /// 是否为块内最后一个系数
    pub last: bool,
}

impl RunLevel {
    /// 带符号的量化值
    pub fn signed_level(&self) -> i32 {
        if self.sign { -self.level } else { self.level }
    }
}

/// 系数解码变体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyStrategy {
    /// MPEG-4 帧内 AC 表
    Intra,
    /// MPEG-4 帧间表
    Inter,
    /// H.263 TCOEF 表
    ShortHeader,
    /// 可逆 VLC (数据分区)
    Reversible,
}

/// 宏块头中与系数重建相关的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroblockHeader {
    pub mode: MacroblockMode,
    /// 6 位编码块模式, 最高位对应块 0
    pub cbp: u8,
    /// 量化参数增量
    pub dquant: i32,
    pub ac_pred: bool,
}

impl MacroblockHeader {
    /// 未编码宏块
    pub fn skipped() -> Self {
        Self {
            mode: MacroblockMode::Skipped,
            cbp: 0,
            dquant: 0,
            ac_pred: false,
        }
    }
}

/// 外部符号解码器
///
/// 运动矢量等与系数无关的字段由实现自行消费.
pub trait SymbolDecoder {
    /// 解码宏块头; 数据分区模式下只读取分区 A 部分
    fn macroblock(
        &mut self,
        cursor: &mut BitCursor,
        frame: &FrameHeader,
    ) -> M4vResult<MacroblockHeader>;

    /// 数据分区模式下读取分区 B 中的宏块字段 (ac_pred, cbpy 等)
    fn partition_header(
        &mut self,
        _cursor: &mut BitCursor,
        _header: &mut MacroblockHeader,
    ) -> M4vResult<()> {
        Ok(())
    }

    /// 解码 intra DC 差值
    fn intra_dc_diff(&mut self, cursor: &mut BitCursor, is_luma: bool) -> M4vResult<i32>;

    /// 解码下一个系数符号
    fn coefficient(
        &mut self,
        cursor: &mut BitCursor,
        strategy: EntropyStrategy,
    ) -> M4vResult<RunLevel>;
}

/// 一帧内使用的系数解码策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDecodePlan {
    pub intra: EntropyStrategy,
    pub inter: EntropyStrategy,
}

impl BlockDecodePlan {
    /// 按层配置与帧头选定策略
    pub fn for_frame(layer: &LayerConfig, frame: &FrameHeader) -> Self {
        if frame.short_header {
            let intra = if frame.advanced_intra {
                EntropyStrategy::Intra
            } else {
                EntropyStrategy::ShortHeader
            };
            return Self {
                intra,
                inter: EntropyStrategy::ShortHeader,
            };
        }
        if layer.data_partitioned && layer.reversible_vlc {
            return Self {
                intra: EntropyStrategy::Reversible,
                inter: EntropyStrategy::Reversible,
            };
        }
        Self {
            intra: EntropyStrategy::Intra,
            inter: EntropyStrategy::Inter,
        }
    }

    /// 按宏块模式取策略
    pub fn strategy(&self, mode: MacroblockMode) -> EntropyStrategy {
        match mode {
            MacroblockMode::Intra => self.intra,
            _ => self.inter,
        }
    }
}
