//! 反量化 (算术 / 矩阵两种模式) 与奇偶校正

/// 系数下限
pub const COEFF_MIN: i32 = -2048;
/// 系数上限
pub const COEFF_MAX: i32 = 2047;

/// 饱和到 `[-2048, 2047]`
pub fn saturate(value: i64) -> i32 {
    value.clamp(i64::from(COEFF_MIN), i64::from(COEFF_MAX)) as i32
}

/// 除法, 结果按远离零方向四舍五入 (den > 0)
pub fn div_round_half_away(num: i64, den: i64) -> i64 {
    let q = (num.abs() + den / 2) / den;
    if num < 0 { -q } else { q }
}

/// 算术模式: `sign * (qp * (2|level| + 1) - (1 - (qp & 1)))`
pub fn dequant_arithmetic(level: i32, qp: u32) -> i32 {
    if level == 0 {
        return 0;
    }
    let qp = i64::from(qp.max(1));
    let magnitude = qp * (2 * i64::from(level.unsigned_abs()) + 1) - (1 - (qp & 1));
    saturate(if level < 0 { -magnitude } else { magnitude })
}

/// 矩阵模式帧内 AC: `2 * level * W * qp / 16`
pub fn dequant_matrix_intra(level: i32, weight: u8, qp: u32) -> i32 {
    let product = 2 * i64::from(level) * i64::from(weight) * i64::from(qp.max(1));
    saturate(div_round_half_away(product, 16))
}

/// 矩阵模式帧间: `(2 * level + sign) * W * qp / 16`
pub fn dequant_matrix_inter(level: i32, weight: u8, qp: u32) -> i32 {
    if level == 0 {
        return 0;
    }
    let level = i64::from(level);
    let product = (2 * level + level.signum()) * i64::from(weight) * i64::from(qp.max(1));
    saturate(div_round_half_away(product, 16))
}

/// 奇偶校正: 所有系数异或结果为偶数时翻转位置 63 的最低位
///
/// 返回是否发生了翻转. 全零块同样会被翻转.
pub fn parity_fixup(block: &mut [i32; 64]) -> bool {
    let parity = block.iter().fold(0i32, |acc, &v| acc ^ v);
    if parity & 1 == 0 {
        block[63] ^= 1;
        true
    } else {
        false
    }
}
