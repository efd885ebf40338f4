//! DC 缩放因子

/// 按量化参数计算 DC 缩放因子
///
/// 分段线性, 各分段在断点处取值相同:
///
/// | qp     | 亮度       | 色度          |
/// |--------|------------|---------------|
/// | 1-4    | 8          | 8             |
/// | 5-8    | 2qp        | (qp + 13) / 2 |
/// | 9-24   | qp + 8     | (qp + 13) / 2 |
/// | >= 25  | 2qp - 16   | qp - 6        |
pub fn dc_scale(qp: u32, is_luma: bool) -> i32 {
    let qp = qp as i32;
    if qp <= 4 {
        return 8;
    }
    if is_luma {
        match qp {
            5..=8 => 2 * qp,
            9..=24 => qp + 8,
            _ => 2 * qp - 16,
        }
    } else {
        match qp {
            5..=24 => (qp + 13) / 2,
            _ => qp - 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dc_scale_low_qp_is_eight() {
        for qp in 1..=4 {
            assert_eq!(dc_scale(qp, true), 8);
            assert_eq!(dc_scale(qp, false), 8);
        }
    }

    #[test]
    fn test_dc_scale_breakpoints_continuous() {
        // 相邻分段的公式在断点处取值相同
        let luma_pieces: [(u32, i32, i32); 3] = [(4, 8, 2 * 4), (8, 2 * 8, 8 + 8), (24, 24 + 8, 2 * 24 - 16)];
        for (qp, left, right) in luma_pieces {
            assert_eq!(left, right, "亮度断点 {qp}");
            assert_eq!(dc_scale(qp, true), left);
        }
        let chroma_pieces: [(u32, i32, i32); 2] = [(4, 8, (4 + 13) / 2), (24, (24 + 13) / 2, 24 - 6)];
        for (qp, left, right) in chroma_pieces {
            assert_eq!(left, right, "色度断点 {qp}");
            assert_eq!(dc_scale(qp, false), left);
        }
        for qp in 1..31 {
            for luma in [true, false] {
                let step = dc_scale(qp + 1, luma) - dc_scale(qp, luma);
                assert!((0..=2).contains(&step), "qp={qp} luma={luma} 跳变 {step}");
            }
        }
    }

    #[test]
    fn test_dc_scale_values() {
        assert_eq!(dc_scale(5, true), 10);
        assert_eq!(dc_scale(9, true), 17);
        assert_eq!(dc_scale(31, true), 46);
        assert_eq!(dc_scale(5, false), 9);
        assert_eq!(dc_scale(25, false), 19);
        assert_eq!(dc_scale(31, false), 25);
    }
}
