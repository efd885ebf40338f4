//! YUV 4:2:0 图像缓冲区.
//!
//! 尺寸按宏块对齐 (16 的倍数). 帧解码器只按宏块整体写入像素:
//! 从参考帧复制, 或以中性灰填充, 像素重建由外部 IDCT/运动补偿完成.

use m4v_core::{M4vError, M4vResult};

/// 中性灰
pub const NEUTRAL_GREY: u8 = 128;

/// 平面下标
pub const PLANE_Y: usize = 0;
pub const PLANE_U: usize = 1;
pub const PLANE_V: usize = 2;

/// YUV 4:2:0 图像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    width: u32,
    height: u32,
    /// Y, U, V 三个平面
    pub data: [Vec<u8>; 3],
    pub linesize: [usize; 3],
}

impl Picture {
    /// 创建以中性灰填充的图像, 宽高向上取整到 16
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, NEUTRAL_GREY)
    }

    /// 创建以 `value` 填充的图像
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        let width = width.div_ceil(16) * 16;
        let height = height.div_ceil(16) * 16;
        let y_size = width as usize * height as usize;
        let uv_size = y_size / 4;
        Self {
            width,
            height,
            data: [vec![value; y_size], vec![value; uv_size], vec![value; uv_size]],
            linesize: [width as usize, width as usize / 2, width as usize / 2],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mb_cols(&self) -> usize {
        self.width as usize / 16
    }

    pub fn mb_rows(&self) -> usize {
        self.height as usize / 16
    }

    pub fn plane(&self, index: usize) -> &[u8] {
        &self.data[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.data[index]
    }

    /// 宏块在各平面中的 (起点偏移, 块边长)
    fn mb_regions(&self, mb_x: usize, mb_y: usize) -> [(usize, usize); 3] {
        let luma = mb_y * 16 * self.linesize[PLANE_Y] + mb_x * 16;
        let chroma = mb_y * 8 * self.linesize[PLANE_U] + mb_x * 8;
        [(luma, 16), (chroma, 8), (chroma, 8)]
    }

    fn check_mb(&self, mb_x: usize, mb_y: usize) -> M4vResult<()> {
        if mb_x >= self.mb_cols() || mb_y >= self.mb_rows() {
            return Err(M4vError::InvalidArgument(format!(
                "宏块 ({}, {}) 超出 {}x{} 网格",
                mb_x,
                mb_y,
                self.mb_cols(),
                self.mb_rows()
            )));
        }
        Ok(())
    }

    /// 从 `source` 复制一个宏块, 两幅图像尺寸必须一致
    pub fn copy_macroblock_from(
        &mut self,
        source: &Picture,
        mb_x: usize,
        mb_y: usize,
    ) -> M4vResult<()> {
        if source.width != self.width || source.height != self.height {
            return Err(M4vError::InvalidArgument(format!(
                "参考帧尺寸 {}x{} 与当前帧 {}x{} 不一致",
                source.width, source.height, self.width, self.height
            )));
        }
        self.check_mb(mb_x, mb_y)?;
        for (plane, (offset, size)) in self.mb_regions(mb_x, mb_y).into_iter().enumerate() {
            let stride = self.linesize[plane];
            for row in 0..size {
                let start = offset + row * stride;
                self.data[plane][start..start + size]
                    .copy_from_slice(&source.data[plane][start..start + size]);
            }
        }
        Ok(())
    }

    /// 以 `value` 填充一个宏块
    pub fn fill_macroblock(&mut self, mb_x: usize, mb_y: usize, value: u8) -> M4vResult<()> {
        self.check_mb(mb_x, mb_y)?;
        for (plane, (offset, size)) in self.mb_regions(mb_x, mb_y).into_iter().enumerate() {
            let stride = self.linesize[plane];
            for row in 0..size {
                let start = offset + row * stride;
                self.data[plane][start..start + size].fill(value);
            }
        }
        Ok(())
    }

    /// 两幅图像中该宏块的像素是否完全相同
    pub fn macroblock_eq(&self, other: &Picture, mb_x: usize, mb_y: usize) -> bool {
        if other.width != self.width || other.height != self.height {
            return false;
        }
        if self.check_mb(mb_x, mb_y).is_err() {
            return false;
        }
        self.mb_regions(mb_x, mb_y)
            .into_iter()
            .enumerate()
            .all(|(plane, (offset, size))| {
                let stride = self.linesize[plane];
                (0..size).all(|row| {
                    let start = offset + row * stride;
                    self.data[plane][start..start + size] == other.data[plane][start..start + size]
                })
            })
    }
}
