//! # m4v-codec
//!
//! MPEG-4 Part 2 Simple Profile 与 H.263 (短头模式) 视频解码的码流层:
//! 头部解析、同步标记搜索、系数重建 (DC/AC 预测与反量化) 以及错误隐藏.
//!
//! 可变长码的熵解码由外部提供, 通过 [`SymbolDecoder`] 接入. IDCT 与运动补偿
//! 不在本 crate 范围内, 帧解码的输出是每宏块 6 个反量化系数块.
//!
//! ## 使用示例
//!
//! ```rust
//! use m4v_codec::{Decoder, DecoderOptions};
//!
//! let mut decoder = Decoder::new(DecoderOptions::default());
//! let base = decoder.base_layer();
//! // 码流中没有任何起始码
//! assert!(decoder.configure(base, &[0xFF; 16]).is_err());
//! ```

pub mod conceal;
pub mod context;
pub mod decoder;
pub mod entropy;
pub mod frame;
pub mod header;
pub mod marker;
pub mod options;
pub mod picture;
pub mod reconstruct;
pub mod tables;

#[cfg(test)]
mod test_support;

// 重导出常用类型
pub use conceal::{ConcealState, ConcealmentController};
pub use context::{MacroblockContext, MacroblockInfo, MacroblockMode};
pub use decoder::{Decoder, LayerIndex};
pub use entropy::{BlockDecodePlan, EntropyStrategy, MacroblockHeader, RunLevel, SymbolDecoder};
pub use frame::{FrameCoefficients, FrameDecoder, FrameReport, MacroblockCoefficients};
pub use header::{FrameHeader, HeaderParser, LayerConfig, ParserState, PictureType, ResyncHeader};
pub use marker::{ResyncPoint, StartCode};
pub use options::DecoderOptions;
pub use picture::Picture;
pub use reconstruct::CoefficientReconstructor;
