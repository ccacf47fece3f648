//! 每个通道一份的滚动日志
//!
//! 每次写入后按行数、再按字节数裁剪，只保留最新的内容。

use crate::config::LogRotation;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// 按通道名生成日志句柄
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
    limits: LogRotation,
}

impl LogSink {
    pub fn new<P: AsRef<Path>>(dir: P, limits: LogRotation) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            limits,
        }
    }

    pub fn channel(&self, name: &str) -> ChannelLog {
        ChannelLog::new(&self.dir, name, self.limits)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelLog {
    channel: String,
    path: PathBuf,
    limits: LogRotation,
}

impl ChannelLog {
    pub fn new<P: AsRef<Path>>(log_dir: P, channel: &str, limits: LogRotation) -> Self {
        Self {
            channel: channel.to_string(),
            path: log_dir.as_ref().join(format!("{}.log", channel)),
            limits,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) {
        info!(channel = %self.channel, "{}", message);
        self.write(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        warn!(channel = %self.channel, "{}", message);
        self.write(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        error!(channel = %self.channel, "{}", message);
        self.write(Level::Error, message);
    }

    /// 写文件失败只记录到 tracing，不影响调用方
    fn write(&self, level: Level, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}] {} {}", stamp, level.as_str(), message);
        if let Err(e) = self.append(&line) {
            warn!(channel = %self.channel, "Failed to write channel log {:?}: {}", self.path, e);
        }
    }

    pub fn append(&self, line: &str) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{}", line)?;
        }
        self.rotate()
    }

    fn rotate(&self) -> io::Result<()> {
        let content = fs::read_to_string(&self.path)?;
        let trimmed = trim_log(&content, self.limits);
        if trimmed.len() != content.len() {
            fs::write(&self.path, trimmed)?;
        }
        Ok(())
    }
}

/// 先保留最后 `max_lines` 行，再保留末尾不超过 `max_bytes` 的完整行
pub fn trim_log(content: &str, limits: LogRotation) -> &str {
    let mut start = 0;

    let line_count = content.lines().count();
    if line_count > limits.max_lines {
        let skip = line_count - limits.max_lines;
        start = content
            .match_indices('\n')
            .nth(skip - 1)
            .map(|(i, _)| i + 1)
            .unwrap_or(content.len());
    }

    let remaining = content.len() - start;
    if remaining > limits.max_bytes {
        let mut cut = content.len() - limits.max_bytes;
        while !content.is_char_boundary(cut) {
            cut += 1;
        }
        // 从完整行开始
        if cut > 0 && content.as_bytes()[cut - 1] != b'\n' {
            cut = content[cut..]
                .find('\n')
                .map(|i| cut + i + 1)
                .unwrap_or(content.len());
        }
        start = start.max(cut);
    }

    &content[start..]
}
