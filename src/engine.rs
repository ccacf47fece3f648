use crate::audio::select_audio_map;
use crate::channels::{normalize_source, output_target, ChannelSpec};
use crate::config::{AppConfig, ParamDefaults};
use crate::logsink::{ChannelLog, LogSink};
use crate::params::{resolve, EncoderClass};
use crate::planner::{honours_cinema_crop, plan, PipelinePlan};
use crate::probe::{FfprobeInspector, FilterCaps, SourceProbe, StreamInspector};
use crate::registry::{ManagedProcess, ProcessRegistry};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::error;

/// 启动外部进程，返回 pid，不等待其退出
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<u32>;
}

pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<u32> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {}", program, e);
                e
            })?;
        // 丢弃句柄后进程继续运行，由 tokio 负责回收
        child
            .id()
            .ok_or_else(|| anyhow::anyhow!("{} exited before reporting a pid", program))
    }
}

/// 一次启动的结果
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub pid: u32,
    pub args: Vec<String>,
    /// 启动前被强制结束的重复进程
    pub killed: Vec<ManagedProcess>,
}

#[async_trait]
pub trait ChannelLauncher: Send + Sync {
    async fn launch(&self, channel: &ChannelSpec) -> anyhow::Result<LaunchReport>;
}

/// 组装完成的 ffmpeg 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub target: String,
    pub args: Vec<String>,
}

/// 按固定顺序拼接参数：通用参数、解码、输入、map、滤镜、编码、输出
pub fn build_args(
    source: &str,
    plan: &PipelinePlan,
    audio_map: &[String],
    output_format: &str,
    target: &str,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(plan.pre_input.iter().cloned());
    args.push("-i".to_string());
    args.push(source.to_string());
    args.extend(audio_map.iter().cloned());
    args.extend(plan.filter.iter().cloned());
    args.extend(plan.encode.iter().cloned());
    args.push("-f".to_string());
    args.push(output_format.to_string());
    args.push(target.to_string());
    args
}

pub struct Engine {
    ffmpeg_binary: String,
    output_prefix: String,
    output_format: String,
    logs: LogSink,
    defaults: ParamDefaults,
    kill_grace: Duration,
    min_free_mem_kb: u64,
    inspector: Arc<dyn StreamInspector>,
    registry: Arc<dyn ProcessRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Engine {
    pub fn new(
        config: &AppConfig,
        inspector: Arc<dyn StreamInspector>,
        registry: Arc<dyn ProcessRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            ffmpeg_binary: config.server.ffmpeg_binary.clone(),
            output_prefix: config.server.output_prefix.clone(),
            output_format: config.server.output_format.clone(),
            logs: LogSink::new(&config.server.log_dir, config.log_rotation),
            defaults: config.defaults.clone(),
            kill_grace: Duration::from_millis(config.server.kill_grace_ms),
            min_free_mem_kb: config.server.min_free_mem_kb,
            inspector,
            registry,
            spawner,
        }
    }

    /// 使用 ffprobe、系统进程表和真实进程启动
    pub fn from_config(config: &AppConfig, registry: Arc<dyn ProcessRegistry>) -> Self {
        let inspector = Arc::new(FfprobeInspector::new(
            &config.server.ffprobe_binary,
            &config.server.ffmpeg_binary,
            config.server.probe_timeout(),
        ));
        Self::new(config, inspector, registry, Arc::new(CommandSpawner))
    }

    pub fn output_target(&self, name: &str) -> String {
        output_target(&self.output_prefix, name)
    }

    pub fn channel_log(&self, name: &str) -> ChannelLog {
        self.logs.channel(name)
    }

    /// 内存不足只告警，不阻止启动
    fn check_memory(&self, log: &ChannelLog) {
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < self.min_free_mem_kb => {
                log.warn(&format!("Low system memory ({} KB available)", mem.avail));
            }
            Ok(_) => {}
            Err(e) => log.warn(&format!("Failed to check memory usage: {}", e)),
        }
    }

    /// 探测源的视频编码与音轨，失败按无数据处理
    async fn inspect(&self, source: &str, log: &ChannelLog) -> SourceProbe {
        let video_codec = match self.inspector.probe_video_codec(source).await {
            Ok(Some(codec)) => {
                log.info(&format!("Detected video codec: {}", codec));
                Some(codec)
            }
            Ok(None) => {
                log.warn("No video stream reported by inspector");
                None
            }
            Err(e) => {
                log.warn(&format!("Video codec probe failed: {}", e));
                None
            }
        };

        let audio_tracks = match self.inspector.probe_audio_tracks(source).await {
            Ok(tracks) => tracks,
            Err(e) => {
                log.warn(&format!("Audio track probe failed: {}", e));
                Vec::new()
            }
        };

        SourceProbe {
            video_codec,
            audio_tracks,
        }
    }

    /// 解析参数、探测源并推导完整的 ffmpeg 参数
    ///
    /// 探测失败或超时视为没有数据，使用安全的默认值继续。
    pub async fn prepare(&self, channel: &ChannelSpec) -> Invocation {
        let log = self.channel_log(&channel.name);
        let params = resolve(&self.defaults, &channel.overrides);

        if let EncoderClass::Unknown(name) = &params.encoder {
            log.warn(&format!(
                "Unknown encoder '{}', falling back to nvenc profile with software scale",
                name
            ));
        }
        if params.cinema_crop && !honours_cinema_crop(&params.encoder) {
            log.warn(&format!("Cinema crop is not supported by encoder '{}', ignored", params.encoder));
        }

        let source = normalize_source(&channel.source);

        let probe = self.inspect(&source, &log).await;

        let caps = if params.encoder == EncoderClass::Qsv && !params.cinema_crop {
            match self.inspector.probe_filter_caps().await {
                Ok(caps) => caps,
                Err(e) => {
                    log.warn(&format!("Filter capability probe failed: {}", e));
                    FilterCaps::default()
                }
            }
        } else {
            FilterCaps::default()
        };

        let plan = plan(&params, probe.video_codec.as_deref(), caps);
        let audio_map = select_audio_map(&params, &probe.audio_tracks);
        let target = self.output_target(&channel.name);
        let args = build_args(&source, &plan, &audio_map, &self.output_format, &target);

        Invocation { target, args }
    }
}

#[async_trait]
impl ChannelLauncher for Engine {
    /// 完整启动流程
    ///
    /// # 副作用
    /// - 强制结束已绑定到同一推流目标的进程
    /// - 启动 ffmpeg 子进程，不等待其退出
    async fn launch(&self, channel: &ChannelSpec) -> anyhow::Result<LaunchReport> {
        let log = self.channel_log(&channel.name);
        log.info(&format!("Launching channel from {}", channel.source));

        self.check_memory(&log);
        let invocation = self.prepare(channel).await;

        let killed = self.registry.kill_bound(&invocation.target);
        if !killed.is_empty() {
            let pids: Vec<String> = killed.iter().map(|p| p.pid.to_string()).collect();
            log.warn(&format!(
                "Killed duplicate process(es) bound to {}: {}",
                invocation.target,
                pids.join(", ")
            ));
            tokio::time::sleep(self.kill_grace).await;
        }

        let pid = self
            .spawner
            .spawn(&self.ffmpeg_binary, &invocation.args)
            .map_err(|e| {
                log.error(&format!("Failed to start {}: {}", self.ffmpeg_binary, e));
                e
            })?;
        log.info(&format!(
            "Started pid {}: {} {}",
            pid,
            self.ffmpeg_binary,
            invocation.args.join(" ")
        ));

        Ok(LaunchReport {
            pid,
            args: invocation.args,
            killed,
        })
    }
}
