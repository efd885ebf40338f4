//! 解码选项

use serde::{Deserialize, Serialize};

/// 解码器选项
///
/// 可由 JSON 反序列化, 缺省字段取默认值:
/// ```
/// use m4v_codec::DecoderOptions;
///
/// let opts: DecoderOptions = serde_json::from_str(r#"{ "tolerant": true }"#).unwrap();
/// assert!(opts.tolerant);
/// assert!(opts.conceal_errors);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DecoderOptions {
    /// 容错模式: 层头部不一致时返回可恢复问题而非失败
    pub tolerant: bool,
    /// 宏块解码失败时执行隐藏; 关闭后失败直接上报
    pub conceal_errors: bool,
    /// 错误恢复时字节对齐搜索的最大扫描距离
    pub max_resync_scan_bytes: Option<usize>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            tolerant: false,
            conceal_errors: true,
            max_resync_scan_bytes: None,
        }
    }
}
