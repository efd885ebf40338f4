//! 系数重建.
//!
//! 一个块的处理顺序: 取 DC 差值 -> 选择预测方向与扫描表 -> 读取 run/level 符号
//! -> 加上 DC/AC 预测 -> 保存预测缓存 -> 反量化 -> 奇偶校正.
//! 输出为光栅顺序的 64 个反量化系数, 交给外部 IDCT.

mod dc;
mod dequant;
mod predict;


use log::trace;
use m4v_core::{BitCursor, M4vError, M4vResult};

use crate::context::MacroblockContext;
use crate::entropy::{BlockDecodePlan, EntropyStrategy, SymbolDecoder};
use crate::header::{FrameHeader, LayerConfig, QuantType};
use crate::tables::{ALTERNATE_HORIZONTAL_SCAN, ALTERNATE_VERTICAL_SCAN, ZIGZAG_SCAN};

pub use dc::dc_scale;
pub use dequant::{
    COEFF_MAX, COEFF_MIN, dequant_arithmetic, dequant_matrix_inter, dequant_matrix_intra,
    parity_fixup, saturate,
};
pub use predict::{
    IntraPredictor, PredictionDirection, apply_ac_prediction, quantized_dc_predictor, rescale_ac,
    select_predictor,
};

/// 高级帧内模式下的固定 DC 缩放因子
const ADVANCED_INTRA_DC_SCALE: i32 = 8;

/// intra DC 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcSource {
    /// 由符号解码器读取差值; 短头基本模式下为 8 位定长码
    Read,
    /// 已在数据分区 A 中读出的差值
    Decoded(i32),
    /// 作为系数流的第 0 个系数出现
    InCoefficients,
}

/// 帧内块请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraBlock {
    pub mb: usize,
    /// 0-3 亮度, 4-5 色度
    pub block: usize,
    pub qp: u32,
    /// 编码块模式中该块是否有系数
    pub coded: bool,
    pub ac_pred: bool,
    pub dc: DcSource,
}

/// 系数重建器, 每帧按层配置与帧头创建
#[derive(Debug, Clone)]
pub struct CoefficientReconstructor {
    plan: BlockDecodePlan,
    frame: FrameHeader,
    quant_type: QuantType,
    intra_matrix: [u8; 64],
    inter_matrix: [u8; 64],
}

impl CoefficientReconstructor {
    pub fn new(layer: &LayerConfig, frame: &FrameHeader) -> Self {
        let quant_type = if frame.short_header {
            QuantType::Arithmetic
        } else {
            layer.quant_type
        };
        Self {
            plan: BlockDecodePlan::for_frame(layer, frame),
            frame: frame.clone(),
            quant_type,
            intra_matrix: layer.intra_matrix,
            inter_matrix: layer.inter_matrix,
        }
    }

    pub fn plan(&self) -> &BlockDecodePlan {
        &self.plan
    }

    /// 按当前量化参数决定 intra DC 的来源
    pub fn dc_source(&self, qp: u32) -> DcSource {
        if self.frame.short_header {
            if self.frame.advanced_intra {
                DcSource::InCoefficients
            } else {
                DcSource::Read
            }
        } else if self.frame.use_intra_dc_vlc(qp) {
            DcSource::Read
        } else {
            DcSource::InCoefficients
        }
    }

    /// 重建一个帧内块
    ///
    /// 当前宏块的元数据须已写入 `ctx`, 以便判定邻居可用性.
    pub fn intra_block<D: SymbolDecoder + ?Sized>(
        &self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        ctx: &mut MacroblockContext,
        request: IntraBlock,
        out: &mut [i32; 64],
    ) -> M4vResult<()> {
        let qp = request.qp.max(1);
        if self.frame.short_header && !self.frame.advanced_intra {
            return self.short_header_intra(cursor, symbols, request, qp, out);
        }

        let is_luma = request.block < 4;
        let advanced_intra = self.frame.advanced_intra;
        let scale = if advanced_intra {
            ADVANCED_INTRA_DC_SCALE
        } else {
            dc_scale(qp, is_luma)
        };
        let predictor = select_predictor(ctx, request.mb, request.block, advanced_intra);

        let mut quantized = [0i32; 64];
        let start = match request.dc {
            DcSource::Read => {
                quantized[0] = symbols.intra_dc_diff(cursor, is_luma)?;
                1
            }
            DcSource::Decoded(diff) => {
                quantized[0] = diff;
                1
            }
            DcSource::InCoefficients => 0,
        };

        let scan = if request.ac_pred {
            match predictor.direction {
                PredictionDirection::Vertical => &ALTERNATE_HORIZONTAL_SCAN,
                PredictionDirection::Horizontal => &ALTERNATE_VERTICAL_SCAN,
            }
        } else {
            &ZIGZAG_SCAN
        };
        if request.coded {
            read_coefficients(cursor, symbols, self.plan.intra, scan, start, &mut quantized)?;
        }

        quantized[0] += quantized_dc_predictor(predictor.dc, scale);
        if request.ac_pred {
            apply_ac_prediction(&mut quantized, &predictor, qp);
        }

        let dc = saturate(i64::from(quantized[0]) * i64::from(scale));
        ctx.store_predictors(request.mb, request.block, dc, &quantized);

        *out = [0; 64];
        out[0] = dc;
        for (pos, &level) in quantized.iter().enumerate().skip(1) {
            if level == 0 {
                continue;
            }
            out[pos] = match self.quant_type {
                QuantType::Arithmetic => dequant_arithmetic(level, qp),
                QuantType::Matrix => dequant_matrix_intra(level, self.intra_matrix[pos], qp),
            };
        }
        if self.quant_type == QuantType::Matrix {
            parity_fixup(out);
        }
        trace!(
            "intra 块: mb={}, block={}, dir={:?}, dc={}",
            request.mb, request.block, predictor.direction, dc
        );
        Ok(())
    }

    /// 短头基本模式的帧内块: 8 位定长 DC, 无预测
    fn short_header_intra<D: SymbolDecoder + ?Sized>(
        &self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        request: IntraBlock,
        qp: u32,
        out: &mut [i32; 64],
    ) -> M4vResult<()> {
        if cursor.bits_left() < 8 {
            return Err(M4vError::EndOfUnit);
        }
        let code = cursor.read(8);
        if code == 0 || code == 128 {
            return Err(M4vError::InvalidData(format!("INTRADC 码字 {} 非法", code)));
        }
        let level = if code == 255 { 128 } else { code as i32 };

        let mut quantized = [0i32; 64];
        if request.coded {
            read_coefficients(
                cursor,
                symbols,
                EntropyStrategy::ShortHeader,
                &ZIGZAG_SCAN,
                1,
                &mut quantized,
            )?;
        }
        *out = [0; 64];
        out[0] = level * 8;
        for (pos, &value) in quantized.iter().enumerate().skip(1) {
            if value != 0 {
                out[pos] = dequant_arithmetic(value, qp);
            }
        }
        Ok(())
    }

    /// 重建一个帧间块, 系数从位置 0 开始, 无预测
    pub fn inter_block<D: SymbolDecoder + ?Sized>(
        &self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        qp: u32,
        out: &mut [i32; 64],
    ) -> M4vResult<()> {
        let qp = qp.max(1);
        let mut quantized = [0i32; 64];
        read_coefficients(cursor, symbols, self.plan.inter, &ZIGZAG_SCAN, 0, &mut quantized)?;

        *out = [0; 64];
        for (pos, &level) in quantized.iter().enumerate() {
            if level == 0 {
                continue;
            }
            out[pos] = match self.quant_type {
                QuantType::Arithmetic => dequant_arithmetic(level, qp),
                QuantType::Matrix => dequant_matrix_inter(level, self.inter_matrix[pos], qp),
            };
        }
        if self.quant_type == QuantType::Matrix {
            parity_fixup(out);
        }
        Ok(())
    }
}

/// 按扫描表读取 run/level 符号, 写入光栅顺序的量化系数
///
/// 索引到达 64 仍未见到 last 标志时返回 `InvalidData`.
fn read_coefficients<D: SymbolDecoder + ?Sized>(
    cursor: &mut BitCursor,
    symbols: &mut D,
    strategy: EntropyStrategy,
    scan: &[usize; 64],
    start: usize,
    quantized: &mut [i32; 64],
) -> M4vResult<()> {
    let mut index = start;
    loop {
        let symbol = symbols.coefficient(cursor, strategy)?;
        index += usize::from(symbol.run);
        if index >= 64 {
            return Err(M4vError::InvalidData(format!(
                "系数索引越界: {} (run={})",
                index, symbol.run
            )));
        }
        quantized[scan[index]] = symbol.signed_level();
        index += 1;
        if symbol.last {
            return Ok(());
        }
        if index >= 64 {
            return Err(M4vError::InvalidData("64 个系数后仍无 last 标志".into()));
        }
    }
}
