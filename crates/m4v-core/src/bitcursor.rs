//! 双字缓存比特游标.
//!
//! 按大端位序 (MSB first) 从调用方持有的字节缓冲区读取位.
//! 内部维护两个 32 位字: `current_word` 左对齐保存接下来 `valid_bits` 个未读位,
//! `lookahead_word` 保存已从缓冲区取出但尚未提升的 `lookahead_valid` 个位.
//! 补充时一次最多从缓冲区取 4 字节, 再整段提升到当前字.
//!
//! 所有操作都不会失败: 越过 `end_pos` 后返回零填充位, 位计数照常推进.

/// 缓存字宽度
const WORD_BITS: u32 = 32;

/// MPEG-4 填充位模式: `0` 后跟 `n - 1` 个 `1`, 下标为填充长度
const STUFFING_PATTERN: [u32; 9] = [0x00, 0x00, 0x01, 0x03, 0x07, 0x0F, 0x1F, 0x3F, 0x7F];

#[inline]
fn shl(word: u32, n: u32) -> u32 {
    if n >= WORD_BITS { 0 } else { word << n }
}

/// 比特游标
///
/// # 示例
/// ```
/// use m4v_core::BitCursor;
///
/// let data = [0b1011_0001, 0b0101_0101];
/// let mut cursor = BitCursor::new(&data);
/// assert_eq!(cursor.peek(4), 0b1011);
/// assert_eq!(cursor.read(4), 0b1011);
/// assert_eq!(cursor.read(12), 0b0001_0101_0101);
/// assert!(cursor.at_end());
/// // 越界后返回零填充位
/// assert_eq!(cursor.read(8), 0);
/// assert_eq!(cursor.position(), 24);
/// ```
#[derive(Debug, Clone)]
pub struct BitCursor<'a> {
    /// 源数据 (借用, 只读)
    buffer: &'a [u8],
    /// 下一个尚未装入缓存的字节偏移
    read_point: usize,
    /// 有效字节长度
    end_pos: usize,
    /// 已消耗的总位数
    bit_count: usize,
    /// 当前字, 高 `valid_bits` 位为接下来的未读位, 其余位恒为 0
    current_word: u32,
    valid_bits: u32,
    /// 预读字, 高 `lookahead_valid` 位紧接在当前字之后
    lookahead_word: u32,
    lookahead_valid: u32,
}

impl<'a> BitCursor<'a> {
    /// 在整个缓冲区上创建游标
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::with_len(buffer, buffer.len())
    }

    /// 在缓冲区前 `len` 字节上创建游标, `len` 超出缓冲区时按缓冲区长度截断
    pub fn with_len(buffer: &'a [u8], len: usize) -> Self {
        let mut cursor = Self {
            buffer,
            read_point: 0,
            end_pos: len.min(buffer.len()),
            bit_count: 0,
            current_word: 0,
            valid_bits: 0,
            lookahead_word: 0,
            lookahead_valid: 0,
        };
        cursor.refill();
        cursor
    }

    /// 切换到新的访问单元
    pub fn reset(&mut self, buffer: &'a [u8]) {
        *self = Self::new(buffer);
    }

    /// 从缓冲区装入最多 4 字节到预读字
    fn load_lookahead(&mut self) {
        let take = (self.end_pos - self.read_point).min(4);
        let mut word = 0u32;
        for (i, &byte) in self.buffer[self.read_point..self.read_point + take]
            .iter()
            .enumerate()
        {
            word |= u32::from(byte) << (24 - 8 * i as u32);
        }
        self.lookahead_word = word;
        self.lookahead_valid = (take * 8) as u32;
        self.read_point += take;
    }

    /// 将预读位提升到当前字, 直到当前字满 32 位或数据耗尽
    fn refill(&mut self) {
        while self.valid_bits < WORD_BITS {
            if self.lookahead_valid == 0 {
                if self.read_point >= self.end_pos {
                    break;
                }
                self.load_lookahead();
            }
            let space = WORD_BITS - self.valid_bits;
            let take = space.min(self.lookahead_valid);
            let bits = self.lookahead_word >> (WORD_BITS - take);
            self.current_word |= bits << (space - take);
            self.lookahead_word = shl(self.lookahead_word, take);
            self.lookahead_valid -= take;
            self.valid_bits += take;
        }
    }

    /// 丢弃当前字中的 `n` 位 (n <= 32), 调用前需已补充
    #[inline]
    fn consume(&mut self, n: u32) {
        self.current_word = shl(self.current_word, n);
        self.valid_bits = self.valid_bits.saturating_sub(n);
        self.bit_count += n as usize;
    }

    /// 窥视 `n` 个位 (n <= 32), 不移动位置
    pub fn peek(&mut self, n: u32) -> u32 {
        debug_assert!(n <= WORD_BITS, "peek: n={} 超过 32 位", n);
        if n == 0 {
            return 0;
        }
        if self.valid_bits < n {
            self.refill();
        }
        self.current_word >> (WORD_BITS - n)
    }

    /// 读取 `n` 个位 (n <= 32)
    pub fn read(&mut self, n: u32) -> u32 {
        let value = self.peek(n);
        self.consume(n);
        value
    }

    /// 读取 1 个位
    #[inline]
    pub fn read1(&mut self) -> u32 {
        if self.valid_bits == 0 {
            self.refill();
        }
        let bit = self.current_word >> 31;
        self.consume(1);
        bit
    }

    /// 读取 1 个位并转换为布尔值
    #[inline]
    pub fn read_flag(&mut self) -> bool {
        self.read1() == 1
    }

    /// 跳过 `n` 个位, 越界部分按零填充计数
    pub fn flush(&mut self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(WORD_BITS as usize) as u32;
            if self.valid_bits < chunk {
                self.refill();
            }
            self.consume(chunk);
            remaining -= chunk as usize;
        }
    }

    /// 对齐到下一个字节边界
    ///
    /// - `force_check = true`: 总是消耗 1-8 位 MPEG-4 填充位 (已对齐时为整字节 `0x7F`),
    ///   返回填充位是否为 `0` 后跟全 `1` 的合法模式.
    /// - `force_check = false`: 只消耗到字节边界的 0-7 位, 接受任意内容;
    ///   返回值表示内容是否为合法填充或 H.263 的全零填充.
    pub fn byte_align(&mut self, force_check: bool) -> bool {
        let offset = (self.bit_count & 7) as u32;
        let n = if force_check { 8 - offset } else { (8 - offset) & 7 };
        if n == 0 {
            return true;
        }
        let bits = self.read(n);
        let stuffing = STUFFING_PATTERN[n as usize];
        if force_check {
            bits == stuffing
        } else {
            bits == stuffing || bits == 0
        }
    }

    /// 窥视字节对齐之后的 `n` 个位, 不移动位置
    ///
    /// 对齐前的填充位必须合法 (规则同 [`byte_align`](Self::byte_align)), 否则返回 `None`.
    /// `n` 不超过 24 位.
    pub fn peek_byte_aligned(&mut self, n: u32, force_check: bool) -> Option<u32> {
        debug_assert!(n <= 24, "peek_byte_aligned: n={} 超过 24 位", n);
        let offset = (self.bit_count & 7) as u32;
        let stuff = if force_check { 8 - offset } else { (8 - offset) & 7 };
        let window = self.peek(stuff + n);
        let mask = (1u32 << n) - 1;
        if stuff == 0 {
            return Some(window & mask);
        }
        let bits = window >> n;
        let stuffing = STUFFING_PATTERN[stuff as usize];
        let valid = if force_check {
            bits == stuffing
        } else {
            bits == stuffing || bits == 0
        };
        valid.then_some(window & mask)
    }

    /// 已消耗的总位数
    pub fn position(&self) -> usize {
        self.bit_count
    }

    /// 已消耗的整字节数
    pub fn byte_position(&self) -> usize {
        self.bit_count / 8
    }

    /// 定位到绝对位位置
    ///
    /// 目标被截断到 `[0, end_pos * 8]`. 先回退到目标之前的 4 字节边界,
    /// 清空缓存后重新补充, 再丢弃字内剩余位, 效果与从 0 开始线性 `flush` 相同.
    pub fn seek(&mut self, bit_pos: usize) {
        let target = bit_pos.min(self.end_pos * 8);
        let word_byte = (target / 8) & !3;
        self.read_point = word_byte;
        self.current_word = 0;
        self.valid_bits = 0;
        self.lookahead_word = 0;
        self.lookahead_valid = 0;
        self.bit_count = word_byte * 8;
        self.refill();
        self.flush(target - word_byte * 8);
    }

    /// 剩余的真实数据位数 (不含零填充)
    pub fn bits_left(&self) -> usize {
        self.valid_bits as usize
            + self.lookahead_valid as usize
            + (self.end_pos - self.read_point) * 8
    }

    /// 真实数据是否已全部消耗
    pub fn at_end(&self) -> bool {
        self.bits_left() == 0
    }

    /// 当前是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_count & 7 == 0
    }

    /// 有效字节长度
    pub fn end_pos(&self) -> usize {
        self.end_pos
    }

    /// 底层数据 (截断到有效长度)
    pub fn data(&self) -> &'a [u8] {
        &self.buffer[..self.end_pos]
    }
}
