//! 解码状态与错误类型定义.
//!
//! 解码流程中的每个操作都返回 [`M4vResult`], 其结果可归入四种 [`Status`]:
//! 成功、单元结束、失败、可恢复的头部问题.

use thiserror::Error;

/// 解码错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum M4vError {
    /// 当前同步单元/帧/缓冲区已正常耗尽, 需要更多输入或进入下一单元
    #[error("单元结束")]
    EndOfUnit,

    /// 无效数据 (损坏的码流, 如量化参数为 0)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 不支持的码流特性 (如非矩形形状、隔行扫描)
    #[error("不支持的特性: {0}")]
    Unsupported(String),

    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 外部熵解码器报告的错误
    #[error("熵解码错误: {0}")]
    Entropy(String),

    /// 层头部不一致, 但已按最佳努力默认值继续 (仅容错模式)
    #[error("可恢复的头部问题: {0}")]
    RecoverableHeader(String),
}

impl M4vError {
    /// 映射到状态分类
    pub fn status(&self) -> Status {
        match self {
            Self::EndOfUnit => Status::EndOfUnit,
            Self::RecoverableHeader(_) => Status::RecoverableHeaderIssue,
            Self::InvalidData(_)
            | Self::Unsupported(_)
            | Self::InvalidArgument(_)
            | Self::Entropy(_) => Status::Failure,
        }
    }

    /// 是否为硬失败
    pub fn is_failure(&self) -> bool {
        self.status() == Status::Failure
    }
}

/// 统一 Result 类型
pub type M4vResult<T> = Result<T, M4vError>;

/// 操作状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 操作按规定完成
    Success,
    /// 当前单元正常耗尽, 不是错误
    EndOfUnit,
    /// 无法局部修复的语义错误
    Failure,
    /// 层头部不一致但可继续解码 (容错模式)
    RecoverableHeaderIssue,
}

impl Status {
    /// 从任意结果推导状态
    pub fn of<T>(result: &M4vResult<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.status(),
        }
    }
}
