use std::path::{Path, PathBuf};
use thiserror::Error;

/// 通道定义，在每次启动或手动重启时从通道列表读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub source: String,
    pub name: String,
    /// 逗号分隔的 `key=value` 覆盖参数
    pub overrides: String,
}

#[derive(Debug, Error)]
pub enum ChannelListError {
    #[error("channel list not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read channel list: {0}")]
    Io(#[from] std::io::Error),
}

/// 解析通道列表文本
///
/// 每行格式为 `source | name | overrides`，字段去除首尾空白。
/// 空行与 `#` 开头的注释行被忽略；缺少名称的行同样跳过。
pub fn parse_channel_list(content: &str) -> Vec<ChannelSpec> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.splitn(3, '|').map(str::trim);
            let source = fields.next()?.to_string();
            let name = fields.next().filter(|n| !n.is_empty())?.to_string();
            let overrides = fields.next().unwrap_or("").to_string();
            if source.is_empty() {
                return None;
            }
            Some(ChannelSpec {
                source,
                name,
                overrides,
            })
        })
        .collect()
}

pub fn load_channel_list<P: AsRef<Path>>(path: P) -> Result<Vec<ChannelSpec>, ChannelListError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ChannelListError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(parse_channel_list(&content))
}

/// 通道的推流目标，同时作为重复进程检测的键
pub fn output_target(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

const UDP_DEFAULT_PARAMS: [(&str, &str); 2] = [("fifo_size", "1000000"), ("overrun_nonfatal", "1")];

/// 为 UDP 组播源补齐缓冲参数，避免 ffmpeg 因 buffer overrun 退出
pub fn normalize_source(uri: &str) -> String {
    if !uri.to_ascii_lowercase().starts_with("udp://") {
        return uri.to_string();
    }

    let mut normalized = uri.to_string();
    for (key, value) in UDP_DEFAULT_PARAMS {
        let has_key = normalized
            .split_once('?')
            .map(|(_, query)| {
                query
                    .split('&')
                    .any(|pair| pair.split('=').next() == Some(key))
            })
            .unwrap_or(false);
        if has_key {
            continue;
        }
        normalized.push(if normalized.contains('?') { '&' } else { '?' });
        normalized.push_str(key);
        normalized.push('=');
        normalized.push_str(value);
    }
    normalized
}
