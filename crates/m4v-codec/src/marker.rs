//! 起始码与同步标记搜索.
//!
//! - 字节粒度: [`locate_start_code`] 查找 `00 00 01` (MPEG-4) 或 `00 00` + `100000` (H.263 PSC).
//! - 位粒度: [`quick_search`] 借助半字节查找表一次跳过多个位, 只在精确匹配处停下.
//! - 字节对齐: [`search_resync_point`] 供错误恢复在字节边界上寻找下一个同步单元.
//!
//! 搜索不修改缓冲区内容; 成功时游标停在匹配处, 失败时游标移到末尾并返回 `EndOfUnit`.

use log::trace;
use m4v_core::{BitCursor, M4vError, M4vResult};

use crate::tables::{FIRST_ONE_IN_NIBBLE, FIRST_ZERO_IN_NIBBLE, LAST_ONE_IN_NIBBLE};

/// motion marker: `1 1111 0000 0000 0001`
pub const MOTION_MARKER: u32 = 0x1F001;
pub const MOTION_MARKER_LEN: u32 = 17;

/// DC marker: `110 1011 0000 0000 0001`
pub const DC_MARKER: u32 = 0x6B001;
pub const DC_MARKER_LEN: u32 = 19;

/// GOB / slice 起始码长度 (16 个 0 + 1)
pub const GOB_MARKER_LEN: u32 = 17;

/// 起始码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCode {
    /// `00 00 01 xx`
    Mpeg4(u8),
    /// H.263 图像起始码 `0000 0000 0000 0000 1000 00`
    ShortHeader,
}

/// 字节对齐搜索的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPoint {
    /// 找到同步标记, 游标位于标记起点
    Marker,
    /// 先遇到 MPEG-4 起始码, 游标位于 `00 00 01` 处
    StartCode,
}

/// 查找第一个起始码的字节偏移, 未找到时返回 `buf.len()`
pub fn locate_start_code(buf: &[u8]) -> usize {
    buf.windows(3)
        .position(|w| w[0] == 0 && w[1] == 0 && (w[2] == 0x01 || w[2] & 0xFC == 0x80))
        .unwrap_or(buf.len())
}

/// 只查找 MPEG-4 起始码 `00 00 01`, 未找到时返回 `buf.len()`
pub fn locate_mpeg4_start_code(buf: &[u8]) -> usize {
    buf.windows(3)
        .position(|w| w == [0x00, 0x00, 0x01])
        .unwrap_or(buf.len())
}

/// 从游标当前位置 (向上取整到字节) 定位下一个起始码
///
/// 成功时游标停在起始码第一个字节处. MPEG-4 起始码缺少标识字节时视为单元结束.
pub fn seek_start_code(cursor: &mut BitCursor) -> M4vResult<StartCode> {
    let data = cursor.data();
    let from = cursor.position().div_ceil(8).min(data.len());
    let offset = from + locate_start_code(&data[from..]);
    if offset >= data.len() {
        cursor.seek(data.len() * 8);
        return Err(M4vError::EndOfUnit);
    }
    cursor.seek(offset * 8);
    if data[offset + 2] == 0x01 {
        match data.get(offset + 3) {
            Some(&id) => Ok(StartCode::Mpeg4(id)),
            None => {
                cursor.seek(data.len() * 8);
                Err(M4vError::EndOfUnit)
            }
        }
    } else {
        Ok(StartCode::ShortHeader)
    }
}

/// 左对齐字中位区间 `[start, end)` 的掩码
fn range_mask(start: u32, end: u32) -> u32 {
    if start >= end || start >= 32 {
        return 0;
    }
    let high = u32::MAX >> start;
    let low = if end >= 32 { u32::MAX } else { !(u32::MAX >> end) };
    high & low
}

fn nibble_at(word: u32, index: u32) -> usize {
    ((word >> (28 - 4 * index)) & 0xF) as usize
}

/// 区间内最后一个 1 的位置
fn last_one(word: u32, start: u32, end: u32) -> Option<u32> {
    let masked = word & range_mask(start, end);
    (0..8)
        .rev()
        .map(|k| (k, nibble_at(masked, k)))
        .find(|&(_, nibble)| nibble != 0)
        .map(|(k, nibble)| 4 * k + LAST_ONE_IN_NIBBLE[nibble])
}

/// 区间内第一个 1 的位置
fn first_one(word: u32, start: u32, end: u32) -> Option<u32> {
    let masked = word & range_mask(start, end);
    (0..8)
        .map(|k| (k, nibble_at(masked, k)))
        .find(|&(_, nibble)| nibble != 0)
        .map(|(k, nibble)| 4 * k + FIRST_ONE_IN_NIBBLE[nibble])
}

/// 区间内第一个 0 的位置
fn first_zero(word: u32, start: u32, end: u32) -> Option<u32> {
    let filled = word | !range_mask(start, end);
    (0..8)
        .map(|k| (k, nibble_at(filled, k)))
        .find(|&(_, nibble)| nibble != 0xF)
        .map(|(k, nibble)| 4 * k + FIRST_ZERO_IN_NIBBLE[nibble])
}

/// 标记的结构: `ones` 个前导 1, ..., 零段 `[zero_start, length - 1)`, 末位为 1
#[derive(Debug, Clone, Copy)]
struct MarkerShape {
    length: u32,
    ones: u32,
    zero_start: u32,
}

impl MarkerShape {
    /// 从字面模式推导结构; 末位不是 1 时返回 `None`
    fn of(pattern: u32, length: u32) -> Option<Self> {
        if pattern & 1 == 0 {
            return None;
        }
        let above = pattern >> 1;
        let zeros = if above == 0 {
            length - 1
        } else {
            above.trailing_zeros().min(length - 1)
        };
        let zero_start = length - 1 - zeros;
        // 左对齐后统计前导 1
        let aligned = pattern << (32 - length);
        let ones = aligned.leading_ones().min(zero_start);
        Some(Self {
            length,
            ones,
            zero_start,
        })
    }

    /// 窗口不匹配时可安全跳过的位数 (不会越过任何匹配位置)
    fn skip(&self, window: u32) -> usize {
        let final_bit = self.length - 1;
        let mut skip = 1u32;

        match last_one(window, self.zero_start, final_bit) {
            Some(p) => skip = skip.max(p - self.zero_start + 1),
            None if (window >> (31 - final_bit)) & 1 == 1 => {
                // 零段与末位都吻合, 失配在前缀: 末位的 1 会落入任何更近偏移的零段
                skip = skip.max(self.length - self.zero_start);
            }
            None => {
                // 末位为 0: 下一个匹配的末位必须落在窗口之后的第一个 1 上
                let next = match first_one(window, self.length, 32) {
                    Some(q) => q - final_bit,
                    None => 32 - final_bit,
                };
                skip = skip.max(next);
            }
        }

        if let Some(z) = first_zero(window, 0, self.ones) {
            skip = skip.max(z + 1);
        }
        skip as usize
    }
}

/// 位粒度搜索字面标记 (length 不超过 24 位)
///
/// 成功时游标停在标记起点 (未消耗). 剩余真实数据不足一个标记时移到末尾并返回 `EndOfUnit`.
pub fn quick_search(cursor: &mut BitCursor, pattern: u32, length: u32) -> M4vResult<()> {
    debug_assert!((1..=24).contains(&length), "quick_search: length={}", length);
    let shape = MarkerShape::of(pattern, length);
    loop {
        if cursor.bits_left() < length as usize {
            cursor.seek(cursor.end_pos() * 8);
            return Err(M4vError::EndOfUnit);
        }
        let window = cursor.peek(32);
        if window >> (32 - length) == pattern {
            trace!("找到标记 0x{:X} 于位 {}", pattern, cursor.position());
            return Ok(());
        }
        let skip = shape.map(|s| s.skip(window)).unwrap_or(1);
        cursor.flush(skip);
    }
}

/// 搜索数据分区的 motion marker (P 帧)
pub fn quick_search_motion_marker(cursor: &mut BitCursor) -> M4vResult<()> {
    quick_search(cursor, MOTION_MARKER, MOTION_MARKER_LEN)
}

/// 搜索数据分区的 DC marker (I 帧)
pub fn quick_search_dc_marker(cursor: &mut BitCursor) -> M4vResult<()> {
    quick_search(cursor, DC_MARKER, DC_MARKER_LEN)
}

/// 从字节偏移处读取 `n` 位 (n <= 32), 越界补 0
fn bits_at(data: &[u8], offset: usize, n: u32) -> u32 {
    let mut word = 0u32;
    for i in 0..4 {
        word = (word << 8) | u32::from(data.get(offset + i).copied().unwrap_or(0));
    }
    if n == 0 { 0 } else { word >> (32 - n) }
}

/// 在字节边界上搜索下一个同步标记 (`marker_len - 1` 个 0 + 1) 或 MPEG-4 起始码
///
/// 从游标当前位置向上取整到字节开始扫描. `max_scan_bytes` 限制扫描距离,
/// 超出或缓冲区耗尽时游标移到末尾并返回 `EndOfUnit`.
pub fn search_resync_point(
    cursor: &mut BitCursor,
    marker_len: u32,
    max_scan_bytes: Option<usize>,
) -> M4vResult<ResyncPoint> {
    let data = cursor.data();
    let start = cursor.position().div_ceil(8);
    let need = marker_len.div_ceil(8) as usize;
    let limit = match max_scan_bytes {
        Some(max) => data.len().min(start.saturating_add(max)),
        None => data.len(),
    };

    let mut offset = start;
    while offset + need <= limit {
        if data[offset] == 0 && offset + 1 < data.len() && data[offset + 1] == 0 {
            if data.get(offset + 2) == Some(&0x01) {
                cursor.seek(offset * 8);
                return Ok(ResyncPoint::StartCode);
            }
            if bits_at(data, offset, marker_len) == 1 {
                cursor.seek(offset * 8);
                return Ok(ResyncPoint::Marker);
            }
        }
        offset += 1;
    }

    trace!("字节对齐搜索未找到同步点: 起始字节 {}", start);
    cursor.seek(data.len() * 8);
    Err(M4vError::EndOfUnit)
}
