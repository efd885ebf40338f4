//! # m4v-core
//!
//! MPEG-4 Simple Profile / H.263 解码核心的底层设施: 状态分类、比特游标与测试用比特写入器.
//!
//! 比特游标永不失败, 越过缓冲区末尾后只返回零填充位, 调用方需自行检查
//! [`BitCursor::at_end`] 与 [`BitCursor::position`].

pub mod bitcursor;
pub mod bitwriter;
pub mod error;

// 重导出常用类型
pub use bitcursor::BitCursor;
pub use error::{M4vError, M4vResult, Status};
