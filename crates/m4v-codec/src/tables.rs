//! 常量表: 扫描顺序、默认量化矩阵与半字节查找表

/// 之字形扫描: 扫描序号 -> 光栅位置
pub const ZIGZAG_SCAN: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, //
    12, 19, 26, 33, 40, 48, 41, 34, 27, 20, 13, 6, 7, 14, 21, 28, //
    35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, //
    58, 59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// 交替水平扫描 (纵向预测时使用)
pub const ALTERNATE_HORIZONTAL_SCAN: [usize; 64] = [
    0, 1, 2, 3, 8, 9, 16, 17, 10, 11, 4, 5, 6, 7, 15, 14, //
    13, 12, 19, 18, 24, 25, 32, 33, 26, 27, 20, 21, 22, 23, 28, 29, //
    30, 31, 34, 35, 40, 41, 48, 49, 42, 43, 36, 37, 38, 39, 44, 45, //
    46, 47, 50, 51, 56, 57, 58, 59, 52, 53, 54, 55, 60, 61, 62, 63,
];

/// 交替垂直扫描 (横向预测时使用)
pub const ALTERNATE_VERTICAL_SCAN: [usize; 64] = [
    0, 8, 16, 24, 1, 9, 2, 10, 17, 25, 32, 40, 48, 56, 57, 49, //
    41, 33, 26, 18, 3, 11, 4, 12, 19, 27, 34, 42, 50, 58, 35, 43, //
    51, 59, 20, 28, 5, 13, 6, 14, 21, 29, 36, 44, 52, 60, 37, 45, //
    53, 61, 22, 30, 7, 15, 23, 31, 38, 46, 54, 62, 39, 47, 55, 63,
];

/// 默认 intra 量化矩阵 (光栅顺序)
pub const DEFAULT_INTRA_MATRIX: [u8; 64] = [
    8, 17, 18, 19, 21, 23, 25, 27, //
    17, 18, 19, 21, 23, 25, 27, 28, //
    20, 21, 22, 23, 24, 26, 28, 30, //
    21, 22, 23, 24, 26, 28, 30, 32, //
    22, 23, 24, 26, 28, 30, 32, 35, //
    23, 24, 26, 28, 30, 32, 35, 38, //
    25, 26, 28, 30, 32, 35, 38, 41, //
    27, 28, 30, 32, 35, 38, 41, 45,
];

/// 默认 inter 量化矩阵 (光栅顺序)
pub const DEFAULT_INTER_MATRIX: [u8; 64] = [
    16, 17, 18, 19, 20, 21, 22, 23, //
    17, 18, 19, 20, 21, 22, 23, 24, //
    18, 19, 20, 21, 22, 23, 24, 25, //
    19, 20, 21, 22, 23, 24, 26, 27, //
    20, 21, 22, 23, 25, 26, 27, 28, //
    21, 22, 23, 24, 26, 27, 28, 30, //
    22, 23, 24, 26, 27, 28, 30, 31, //
    23, 24, 25, 27, 28, 30, 31, 33,
];

/// 半字节中第一个 1 的位置 (从高位数起, 无则为 4)
pub const FIRST_ONE_IN_NIBBLE: [u32; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

/// 半字节中最后一个 1 的位置 (从高位数起, 无则为 4)
pub const LAST_ONE_IN_NIBBLE: [u32; 16] = [4, 3, 2, 3, 1, 3, 2, 3, 0, 3, 2, 3, 1, 3, 2, 3];

/// 半字节中第一个 0 的位置 (从高位数起, 无则为 4)
pub const FIRST_ZERO_IN_NIBBLE: [u32; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 4];

/// H.263 标准源格式分辨率, 下标为 source_format 码
pub const H263_SOURCE_FORMATS: [(u32, u32); 6] = [
    (0, 0),       // 禁止
    (128, 96),    // Sub-QCIF
    (176, 144),   // QCIF
    (352, 288),   // CIF
    (704, 576),   // 4CIF
    (1408, 1152), // 16CIF
];
