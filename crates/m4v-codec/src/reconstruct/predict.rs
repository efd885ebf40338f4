//! 帧内 DC/AC 预测
//!
//! 邻居 A (左), B (左上), C (上). 若 |A - B| <= |B - C| 则从上方 (C) 预测,
//! 否则从左方 (A) 预测. 不可用的邻居 DC 取 1024, AC 取 0.

use crate::context::{DC_PREDICTOR_DEFAULT, MacroblockContext, Neighbour};

use super::dequant::div_round_half_away;

/// 预测方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionDirection {
    /// 从上方块预测, 修正首行
    Vertical,
    /// 从左方块预测, 修正首列
    Horizontal,
}

/// 选中的预测值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraPredictor {
    pub direction: PredictionDirection,
    /// 重建域 DC
    pub dc: i32,
    /// 量化域 AC: 垂直方向为上方块首行, 水平方向为左方块首列
    pub ac: [i32; 7],
    /// 预测源宏块的量化参数, 不可用时为 0
    pub ac_qp: u32,
}

/// 为块 `(mb, block)` 选择预测值
///
/// 调用前当前宏块的元数据须已写入上下文.
pub fn select_predictor(
    ctx: &MacroblockContext,
    mb: usize,
    block: usize,
    advanced_intra: bool,
) -> IntraPredictor {
    let available = |side| {
        ctx.neighbour(mb, block, side)
            .filter(|&(nmb, _)| ctx.predictor_available(mb, nmb, advanced_intra))
    };
    let left = available(Neighbour::Left);
    let upper_left = available(Neighbour::UpperLeft);
    let upper = available(Neighbour::Upper);

    let dc_of = |n: Option<(usize, usize)>| n.map_or(DC_PREDICTOR_DEFAULT, |(m, k)| ctx.dc(m, k));
    let a = dc_of(left);
    let b = dc_of(upper_left);
    let c = dc_of(upper);

    if (a - b).abs() <= (b - c).abs() {
        let (ac, ac_qp) = upper.map_or(([0; 7], 0), |(m, k)| (*ctx.ac_row(m, k), ctx.info(m).qp));
        IntraPredictor {
            direction: PredictionDirection::Vertical,
            dc: c,
            ac,
            ac_qp,
        }
    } else {
        let (ac, ac_qp) = left.map_or(([0; 7], 0), |(m, k)| (*ctx.ac_col(m, k), ctx.info(m).qp));
        IntraPredictor {
            direction: PredictionDirection::Horizontal,
            dc: a,
            ac,
            ac_qp,
        }
    }
}

/// 重建域 DC 预测值换算到量化域: `pred / scale`, 远离零方向舍入
pub fn quantized_dc_predictor(dc: i32, scale: i32) -> i32 {
    div_round_half_away(i64::from(dc), i64::from(scale.max(1))) as i32
}

/// 按量化参数比例缩放 AC 预测值, 远离零方向舍入
pub fn rescale_ac(ac: i32, from_qp: u32, to_qp: u32) -> i32 {
    if ac == 0 || from_qp == 0 || from_qp == to_qp {
        return ac;
    }
    div_round_half_away(i64::from(ac) * i64::from(from_qp), i64::from(to_qp.max(1))) as i32
}

/// 把 AC 预测加到量化系数的首行或首列
pub fn apply_ac_prediction(quantized: &mut [i32; 64], predictor: &IntraPredictor, qp: u32) {
    for (i, &ac) in predictor.ac.iter().enumerate() {
        let pos = match predictor.direction {
            PredictionDirection::Vertical => i + 1,
            PredictionDirection::Horizontal => (i + 1) * 8,
        };
        quantized[pos] += rescale_ac(ac, predictor.ac_qp, qp);
    }
}
