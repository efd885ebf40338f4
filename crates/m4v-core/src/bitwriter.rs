//! 比特流构造器.
//!
//! 按大端位序拼装码流, 用于构造测试码流与工具输出.
//! 提供 MPEG-4 填充位、起始码与 marker 位等语法元素的快捷写法.

/// 比特流写入器
///
/// # 示例
/// ```
/// use m4v_core::bitwriter::BitWriter;
///
/// let mut bw = BitWriter::new();
/// bw.write_start_code(0xB6);
/// bw.write_bits(0b01, 2);
/// bw.write_stuffing();
/// assert_eq!(bw.finish(), vec![0x00, 0x00, 0x01, 0xB6, 0b0101_1111]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    /// 已完成的字节
    bytes: Vec<u8>,
    /// 尚未凑满一个字节的位, 低 `pending_bits` 位有效
    pending: u8,
    pending_bits: u32,
}

impl BitWriter {
    /// 创建空的写入器
    pub fn new() -> Self {
        Self::default()
    }

    /// 已写入的总位数
    pub fn bits_written(&self) -> usize {
        self.bytes.len() * 8 + self.pending_bits as usize
    }

    /// 是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.pending_bits == 0
    }

    /// 写入 `value` 的低 `n` 位 (n <= 32), 高位在前
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32, "write_bits: n={} 超过 32 位", n);
        for shift in (0..n).rev() {
            self.push_bit(((value >> shift) & 1) as u8);
        }
    }

    /// 写入 1 个位
    pub fn write_flag(&mut self, flag: bool) {
        self.push_bit(u8::from(flag));
    }

    /// 写入 marker 位 (恒为 1)
    pub fn write_marker(&mut self) {
        self.push_bit(1);
    }

    /// 写入 `count` 个 1 后跟一个 0 (一元码)
    pub fn write_unary_ones(&mut self, count: u32) {
        for _ in 0..count {
            self.push_bit(1);
        }
        self.push_bit(0);
    }

    /// 写入 MPEG-4 填充位: `0` 后跟 `1` 直到字节边界, 已对齐时写整字节 `0x7F`
    pub fn write_stuffing(&mut self) {
        self.push_bit(0);
        while self.pending_bits != 0 {
            self.push_bit(1);
        }
    }

    /// 以 0 填充到字节边界 (H.263 风格)
    pub fn align_zero(&mut self) {
        while self.pending_bits != 0 {
            self.push_bit(0);
        }
    }

    /// 写入字节对齐的 `00 00 01 xx` 起始码, 未对齐时先补 0
    pub fn write_start_code(&mut self, code: u8) {
        self.align_zero();
        self.bytes.extend_from_slice(&[0x00, 0x00, 0x01, code]);
    }

    /// 直接追加字节, 要求已对齐
    pub fn write_bytes(&mut self, data: &[u8]) {
        debug_assert!(self.is_byte_aligned(), "write_bytes 需要字节对齐");
        self.bytes.extend_from_slice(data);
    }

    fn push_bit(&mut self, bit: u8) {
        self.pending = (self.pending << 1) | (bit & 1);
        self.pending_bits += 1;
        if self.pending_bits == 8 {
            self.bytes.push(self.pending);
            self.pending = 0;
            self.pending_bits = 0;
        }
    }

    /// 完成写入, 不足一字节的部分以 0 补齐
    pub fn finish(mut self) -> Vec<u8> {
        self.align_zero();
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BitCursor;

    #[test]
    fn test_write_bits_msb_first() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b1011, 4);
        bw.write_bits(0b0001, 4);
        bw.write_bits(0x1FF, 9);
        assert_eq!(bw.bits_written(), 17);
        assert_eq!(bw.finish(), vec![0b1011_0001, 0xFF, 0x80]);
    }

    #[test]
    fn test_stuffing_when_aligned() {
        let mut bw = BitWriter::new();
        bw.write_stuffing();
        assert_eq!(bw.finish(), vec![0x7F]);
    }

    #[test]
    fn test_roundtrip_through_cursor() {
        let mut bw = BitWriter::new();
        bw.write_bits(5, 3);
        bw.write_unary_ones(3);
        bw.write_marker();
        bw.write_stuffing();
        let data = bw.finish();
        let mut cursor = BitCursor::new(&data);
        assert_eq!(cursor.read(3), 5);
        assert_eq!(cursor.read(4), 0b1110);
        assert_eq!(cursor.read1(), 1);
        assert!(cursor.byte_align(true));
        assert!(cursor.at_end());
    }
}
