//! 宏块上下文: 每宏块元数据与 AC/DC 预测缓存.
//!
//! 缓存按宏块索引, 每宏块 6 个块 (4 个亮度 + 2 个色度).
//! DC 缓存存放重建后的 DC 值, AC 缓存存放量化域的首行/首列.
//! 上下文只在一帧内有效, 每帧开始时由 [`MacroblockContext::reset`] 清空.

/// 未解码宏块的条带号, 与任何真实条带都不相同
pub const SLICE_UNDECODED: u32 = u32::MAX;

/// 默认 DC 预测值 (重建域)
pub const DC_PREDICTOR_DEFAULT: i32 = 1024;

/// 宏块模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacroblockMode {
    Intra,
    Inter,
    /// 未编码或被隐藏
    #[default]
    Skipped,
}

/// 单个宏块的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroblockInfo {
    pub mode: MacroblockMode,
    pub qp: u32,
    /// 6 位编码块模式, 最高位对应块 0
    pub cbp: u8,
    /// 所属同步单元序号
    pub slice: u32,
    pub ac_pred: bool,
}

impl Default for MacroblockInfo {
    fn default() -> Self {
        Self {
            mode: MacroblockMode::Skipped,
            qp: 0,
            cbp: 0,
            slice: SLICE_UNDECODED,
            ac_pred: false,
        }
    }
}

impl MacroblockInfo {
    /// 块 `block` 是否有编码系数
    pub fn block_coded(&self, block: usize) -> bool {
        self.cbp & (0x20 >> block) != 0
    }
}

/// 块的预测缓存: DC 与 7 个首行/首列 AC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockPredictors {
    dc: i32,
    row: [i32; 7],
    col: [i32; 7],
}

impl Default for BlockPredictors {
    fn default() -> Self {
        Self {
            dc: DC_PREDICTOR_DEFAULT,
            row: [0; 7],
            col: [0; 7],
        }
    }
}

/// 邻居方位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbour {
    Left,
    UpperLeft,
    Upper,
}

/// 宏块上下文
#[derive(Debug, Clone, Default)]
pub struct MacroblockContext {
    mb_cols: usize,
    mb_rows: usize,
    info: Vec<MacroblockInfo>,
    predictors: Vec<[BlockPredictors; 6]>,
}

impl MacroblockContext {
    /// 按宏块网格创建
    pub fn new(mb_cols: usize, mb_rows: usize) -> Self {
        let mut ctx = Self::default();
        ctx.resize(mb_cols, mb_rows);
        ctx
    }

    /// 调整网格尺寸并清空
    pub fn resize(&mut self, mb_cols: usize, mb_rows: usize) {
        self.mb_cols = mb_cols;
        self.mb_rows = mb_rows;
        self.reset();
    }

    /// 新帧开始: 所有宏块标记为未解码, 预测缓存恢复默认值
    pub fn reset(&mut self) {
        let total = self.mb_cols * self.mb_rows;
        self.info.clear();
        self.info.resize(total, MacroblockInfo::default());
        self.predictors.clear();
        self.predictors.resize(total, [BlockPredictors::default(); 6]);
    }

    pub fn mb_cols(&self) -> usize {
        self.mb_cols
    }

    pub fn mb_rows(&self) -> usize {
        self.mb_rows
    }

    pub fn total_mbs(&self) -> usize {
        self.info.len()
    }

    pub fn info(&self, mb: usize) -> &MacroblockInfo {
        &self.info[mb]
    }

    pub fn infos(&self) -> &[MacroblockInfo] {
        &self.info
    }

    /// 写入宏块元数据; 非帧内宏块同时清空其预测缓存
    pub fn set_info(&mut self, mb: usize, info: MacroblockInfo) {
        if info.mode != MacroblockMode::Intra {
            self.predictors[mb] = [BlockPredictors::default(); 6];
        }
        self.info[mb] = info;
    }

    /// 将宏块标记为跳过并归入条带 `slice`
    pub fn mark_skipped(&mut self, mb: usize, slice: u32) {
        self.set_info(
            mb,
            MacroblockInfo {
                slice,
                ..MacroblockInfo::default()
            },
        );
    }

    /// 定位块 `block` 的邻居块, 越过图像边缘时返回 `None`
    ///
    /// 亮度块排列为 `0 1 / 2 3`, 色度块 4/5 的邻居为相邻宏块的同号块.
    pub fn neighbour(&self, mb: usize, block: usize, side: Neighbour) -> Option<(usize, usize)> {
        let mb_x = mb % self.mb_cols.max(1);
        let mb_y = mb / self.mb_cols.max(1);
        // (宏块列偏移, 宏块行偏移, 块号)
        let (dx, dy, target) = match (block, side) {
            (0, Neighbour::Left) => (-1, 0, 1),
            (0, Neighbour::UpperLeft) => (-1, -1, 3),
            (0, Neighbour::Upper) => (0, -1, 2),
            (1, Neighbour::Left) => (0, 0, 0),
            (1, Neighbour::UpperLeft) => (0, -1, 2),
            (1, Neighbour::Upper) => (0, -1, 3),
            (2, Neighbour::Left) => (-1, 0, 3),
            (2, Neighbour::UpperLeft) => (-1, 0, 1),
            (2, Neighbour::Upper) => (0, 0, 0),
            (3, Neighbour::Left) => (0, 0, 2),
            (3, Neighbour::UpperLeft) => (0, 0, 0),
            (3, Neighbour::Upper) => (0, 0, 1),
            (_, Neighbour::Left) => (-1, 0, block),
            (_, Neighbour::UpperLeft) => (-1, -1, block),
            (_, Neighbour::Upper) => (0, -1, block),
        };
        let x = mb_x.checked_add_signed(dx)?;
        let y = mb_y.checked_add_signed(dy)?;
        if x >= self.mb_cols || y >= self.mb_rows {
            return None;
        }
        Some((y * self.mb_cols + x, target))
    }

    /// 邻居宏块的预测值能否被 `mb` 使用
    ///
    /// 同一宏块内总是可用; 其他宏块须与当前宏块同条带,
    /// 高级帧内模式下还须为帧内宏块.
    pub fn predictor_available(&self, mb: usize, neighbour_mb: usize, advanced_intra: bool) -> bool {
        if neighbour_mb == mb {
            return true;
        }
        let current = &self.info[mb];
        let neighbour = &self.info[neighbour_mb];
        if neighbour.slice != current.slice {
            return false;
        }
        !advanced_intra || neighbour.mode == MacroblockMode::Intra
    }

    pub fn dc(&self, mb: usize, block: usize) -> i32 {
        self.predictors[mb][block].dc
    }

    /// 量化域首行 AC (光栅位置 1..8)
    pub fn ac_row(&self, mb: usize, block: usize) -> &[i32; 7] {
        &self.predictors[mb][block].row
    }

    /// 量化域首列 AC (光栅位置 8, 16, ..., 56)
    pub fn ac_col(&self, mb: usize, block: usize) -> &[i32; 7] {
        &self.predictors[mb][block].col
    }

    /// 保存帧内块的预测值
    pub fn store_predictors(&mut self, mb: usize, block: usize, dc: i32, quantized: &[i32; 64]) {
        let entry = &mut self.predictors[mb][block];
        entry.dc = dc;
        for i in 0..7 {
            entry.row[i] = quantized[i + 1];
            entry.col[i] = quantized[(i + 1) * 8];
        }
    }
}
