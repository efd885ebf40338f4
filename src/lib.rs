//! # m4v
//!
//! MPEG-4 Part 2 Simple Profile 与 H.263 视频码流解码核心.
//!
//! 提供比特游标、同步标记搜索、分层头部解析、系数重建与错误隐藏.
//! 熵解码、IDCT 与运动补偿由外部组件完成.
//!
//! # 快速开始
//!
//! ```rust
//! use m4v::core::BitCursor;
//!
//! let data = [0x00, 0x00, 0x01, 0xB6];
//! let mut cursor = BitCursor::new(&data);
//! assert_eq!(cursor.read(24), 1);
//! assert_eq!(cursor.read(8), 0xB6);
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `m4v-core` | 状态分类、比特游标与比特写入器 |
//! | `m4v-codec` | 头部解析、系数重建、错误隐藏与帧解码循环 |

/// 底层设施
pub use m4v_core as core;

/// 码流解码
pub use m4v_codec as codec;

pub mod logging;

/// 获取版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
