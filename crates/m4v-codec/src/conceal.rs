//! 错误隐藏.
//!
//! 宏块解码失败后, 从失败位置字节对齐地搜索下一个同步点, 再把失败宏块到
//! 下一同步单元首宏块之间的所有宏块以参考帧内容 (无参考帧时为中性灰) 替代,
//! 并标记为跳过. 被隐藏的宏块系数清零, 条带号取新值, 使之后的预测不会越过损坏区域.

use std::ops::Range;

use log::{debug, warn};
use m4v_core::{BitCursor, M4vResult};

use crate::context::MacroblockContext;
use crate::marker::{self, ResyncPoint};
use crate::picture::{NEUTRAL_GREY, Picture};

/// 隐藏状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcealState {
    #[default]
    Normal,
    /// 自 `from` 起的宏块已失效, 正在等待同步点
    Concealing { from: usize },
}

/// 错误隐藏控制器
#[derive(Debug, Clone, Default)]
pub struct ConcealmentController {
    state: ConcealState,
    /// 本帧已隐藏的宏块数
    concealed: usize,
}

impl ConcealmentController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConcealState {
        self.state
    }

    /// 本帧已隐藏的宏块数
    pub fn concealed_mbs(&self) -> usize {
        self.concealed
    }

    /// 新帧开始
    pub fn begin_frame(&mut self) {
        self.state = ConcealState::Normal;
        self.concealed = 0;
    }

    /// 记录宏块 `mb` 解码失败
    pub fn on_failure(&mut self, mb: usize, position: usize) {
        warn!("宏块 {} 解码失败 (位 {}), 开始错误隐藏", mb, position);
        self.state = ConcealState::Concealing { from: mb };
    }

    /// 从游标处字节对齐地搜索下一个同步标记或起始码
    ///
    /// 找到时游标停在标记起点; 未找到时游标移到末尾并返回 `EndOfUnit`.
    pub fn realign(
        &mut self,
        cursor: &mut BitCursor,
        marker_len: u32,
        max_scan_bytes: Option<usize>,
    ) -> M4vResult<ResyncPoint> {
        let from = cursor.position();
        let point = marker::search_resync_point(cursor, marker_len, max_scan_bytes)?;
        debug!(
            "重新同步: 位 {} -> {} ({:?})",
            from,
            cursor.position(),
            point
        );
        Ok(point)
    }

    /// 隐藏 `range` 内的宏块
    ///
    /// 参考帧尺寸不一致时按无参考帧处理. `blocks` 中对应宏块的系数清零.
    /// 返回实际隐藏的宏块数.
    pub fn conceal_range(
        &mut self,
        ctx: &mut MacroblockContext,
        current: &mut Picture,
        reference: Option<&Picture>,
        range: Range<usize>,
        slice: u32,
        blocks: &mut [[[i32; 64]; 6]],
    ) -> M4vResult<usize> {
        let end = range.end.min(ctx.total_mbs());
        let start = range.start.min(end);
        let cols = ctx.mb_cols().max(1);
        let reference = reference
            .filter(|r| r.width() == current.width() && r.height() == current.height());
        for mb in start..end {
            let (mb_x, mb_y) = (mb % cols, mb / cols);
            match reference {
                Some(r) => current.copy_macroblock_from(r, mb_x, mb_y)?,
                None => current.fill_macroblock(mb_x, mb_y, NEUTRAL_GREY)?,
            }
            ctx.mark_skipped(mb, slice);
            if let Some(block) = blocks.get_mut(mb) {
                *block = [[0; 64]; 6];
            }
        }
        let count = end - start;
        if count > 0 {
            debug!(
                "隐藏宏块 [{}, {}), 条带 {}, {}",
                start,
                end,
                slice,
                if reference.is_some() { "参考帧复制" } else { "灰色填充" }
            );
        }
        self.concealed += count;
        self.state = ConcealState::Normal;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MacroblockMode;

    #[test]
    fn test_conceal_range_copies_reference() {
        let mut ctx = MacroblockContext::new(4, 4);
        let mut current = Picture::new(64, 64);
        let reference = Picture::filled(64, 64, 77);
        let mut blocks = vec![[[5i32; 64]; 6]; 16];
        let mut conceal = ConcealmentController::new();

        conceal.on_failure(5, 100);
        assert_eq!(conceal.state(), ConcealState::Concealing { from: 5 });
        let count = conceal
            .conceal_range(&mut ctx, &mut current, Some(&reference), 5..12, 3, &mut blocks)
            .unwrap();
        assert_eq!(count, 7);
        assert_eq!(conceal.concealed_mbs(), 7);
        assert_eq!(conceal.state(), ConcealState::Normal);

        for mb in 0..16 {
            let (x, y) = (mb % 4, mb / 4);
            let inside = (5..12).contains(&mb);
            assert_eq!(current.macroblock_eq(&reference, x, y), inside, "宏块 {mb}");
            if inside {
                assert_eq!(ctx.info(mb).slice, 3);
                assert_eq!(ctx.info(mb).mode, MacroblockMode::Skipped);
                assert!(blocks[mb].iter().all(|b| b.iter().all(|&c| c == 0)));
            } else {
                assert_eq!(blocks[mb][0][0], 5);
            }
        }
    }

    #[test]
    fn test_conceal_without_reference_fills_grey() {
        let mut ctx = MacroblockContext::new(2, 1);
        let mut current = Picture::filled(32, 16, 9);
        let mut conceal = ConcealmentController::new();
        // 范围超过网格时截断
        let count = conceal
            .conceal_range(&mut ctx, &mut current, None, 1..10, 0, &mut [])
            .unwrap();
        assert_eq!(count, 1);
        assert!(current.macroblock_eq(&Picture::new(32, 16), 1, 0));
        assert!(!current.macroblock_eq(&Picture::new(32, 16), 0, 0));

        // 尺寸不一致的参考帧按无参考处理
        let other = Picture::filled(16, 16, 50);
        conceal
            .conceal_range(&mut ctx, &mut current, Some(&other), 0..1, 0, &mut [])
            .unwrap();
        assert!(current.macroblock_eq(&Picture::new(32, 16), 0, 0));
        assert_eq!(conceal.concealed_mbs(), 2);
    }

    #[test]
    fn test_realign_finds_marker_or_ends() {
        let data = [0xAB, 0xCD, 0xEF, 0x00, 0x00, 0x80, 0x12];
        let mut cursor = BitCursor::new(&data);
        cursor.read(3);
        let mut conceal = ConcealmentController::new();
        let point = conceal.realign(&mut cursor, 17, None).unwrap();
        assert_eq!(point, ResyncPoint::Marker);
        assert_eq!(cursor.position(), 24);

        let data = [0xAB, 0xCD, 0xEF, 0x12];
        let mut cursor = BitCursor::new(&data);
        assert_eq!(
            conceal.realign(&mut cursor, 17, None),
            Err(m4v_core::M4vError::EndOfUnit)
        );
        assert!(cursor.at_end());
    }
}
