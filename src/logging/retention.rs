//! 滚动日志的过期清理

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::fs;
use std::path::{Path, PathBuf};

/// 指定日期的滚动日志路径
pub fn rotated_log_path(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}

/// 从文件名解析滚动日期, 不属于该前缀的文件返回 `None`
pub fn parse_rotated_log_name(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date_part = file_name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    if date_part.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// 删除早于 `today - retention_days` 的滚动日志, 返回删除的文件数
pub fn cleanup_expired_logs(
    directory: &Path,
    prefix: &str,
    retention_days: i64,
    today: NaiveDate,
) -> Result<usize> {
    if !directory.exists() {
        return Ok(0);
    }
    let cutoff = today - ChronoDuration::days(retention_days.max(0));
    let mut removed = 0;
    let entries = fs::read_dir(directory)
        .with_context(|| format!("读取日志目录失败, path={}", directory.display()))?;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = parse_rotated_log_name(&file_name, prefix) else {
            continue;
        };
        if date < cutoff {
            fs::remove_file(entry.path())
                .with_context(|| format!("删除过期日志失败, path={}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
