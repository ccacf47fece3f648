use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervision: SupervisionPolicy,
    #[serde(default)]
    pub log_rotation: LogRotation,

    /// 通道参数默认模板，每次启动时复制，不会被通道覆盖值修改
    #[serde(default)]
    pub defaults: ParamDefaults,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// 管理 API 监听地址，未配置时不启动 HTTP 服务
    pub listen: Option<String>,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub channels_file: String,
    /// 推流目标前缀，通道输出目标为 `<prefix>/<name>`
    pub output_prefix: String,
    pub output_format: String,
    pub log_dir: String,
    pub supervisor_interval_sec: u64,
    /// ffprobe / ffmpeg 探测的硬超时
    pub probe_timeout_sec: u64,
    /// 强制结束重复进程后，等待多久再启动新进程
    pub kill_grace_ms: u64,
    pub min_free_mem_kb: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            channels_file: "channels.txt".to_string(),
            output_prefix: "rtmp://127.0.0.1/live".to_string(),
            output_format: "flv".to_string(),
            log_dir: "./logs".to_string(),
            supervisor_interval_sec: 60,
            probe_timeout_sec: 8,
            kill_grace_ms: 500,
            min_free_mem_kb: 5120,
        }
    }
}

impl ServerConfig {
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_sec.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }
}

/// 故障退避策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisionPolicy {
    /// 统计失败次数的滑动窗口 (秒)
    pub failure_window_sec: u64,
    /// 窗口内失败次数超过该值即暂停
    pub max_failures: usize,
    /// 暂停时长 (秒)
    pub pause_sec: u64,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            failure_window_sec: 600,
            max_failures: 5,
            pause_sec: 600,
        }
    }
}

impl SupervisionPolicy {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_sec)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_sec)
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct LogRotation {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            max_bytes: 256 * 1024,
        }
    }
}

/// 通道参数默认值，键名与覆盖字符串中的键一致
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ParamDefaults {
    pub nodeint: bool,
    pub encoder: String,
    pub map: String,
    pub audio: String,
    pub bitrate: String,
    pub scale: String,
    pub screen: bool,
    pub nodecdeint: bool,
}

impl Default for ParamDefaults {
    fn default() -> Self {
        Self {
            nodeint: false,
            encoder: "nvenc".to_string(),
            map: "auto".to_string(),
            audio: "auto".to_string(),
            bitrate: "2500k".to_string(),
            scale: "1280:720".to_string(),
            screen: false,
            nodecdeint: false,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
