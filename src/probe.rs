//! 调用外部 ffprobe / ffmpeg 探测源属性与滤镜能力
//!
//! 所有外部调用都带硬超时，超时或失败由调用方按 "无数据" 处理。

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 源中的一条音轨
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    /// 在音频流中的序号 (从 0 开始)，音轨选择以此为准
    pub pos: usize,
    /// 容器内的绝对流序号
    pub index: u32,
    pub lang: String,
}

/// 单次启动的探测结果，不跨启动缓存
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceProbe {
    pub video_codec: Option<String>,
    pub audio_tracks: Vec<AudioTrack>,
}

/// ffmpeg 可用的 QSV 滤镜
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterCaps {
    pub deinterlace_qsv: bool,
    pub scale_qsv: bool,
}

#[async_trait]
pub trait StreamInspector: Send + Sync {
    async fn probe_video_codec(&self, source: &str) -> Result<Option<String>, ProbeError>;

    async fn probe_audio_tracks(&self, source: &str) -> Result<Vec<AudioTrack>, ProbeError>;

    async fn probe_filter_caps(&self) -> Result<FilterCaps, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
}

/// 从 ffprobe JSON 中取第一条视频流的编码名
pub fn parse_video_codec(json: &[u8]) -> Result<Option<String>, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(json)?;
    Ok(output
        .streams
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .find_map(|s| s.codec_name)
        .filter(|name| !name.is_empty()))
}

/// 从 ffprobe JSON 中按出现顺序列出音轨
pub fn parse_audio_tracks(json: &[u8]) -> Result<Vec<AudioTrack>, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(json)?;
    Ok(output
        .streams
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .enumerate()
        .map(|(pos, s)| AudioTrack {
            pos,
            index: s.index,
            lang: s.tags.language.unwrap_or_else(|| "und".to_string()),
        })
        .collect())
}

/// 解析 `ffmpeg -filters` 输出
pub fn parse_filter_caps(listing: &str) -> FilterCaps {
    let mut caps = FilterCaps::default();
    for line in listing.lines() {
        // " ... deinterlace_qsv   V->V       QuickSync video deinterlacing"
        match line.split_whitespace().nth(1) {
            Some("deinterlace_qsv") => caps.deinterlace_qsv = true,
            Some("scale_qsv") => caps.scale_qsv = true,
            _ => {}
        }
    }
    caps
}

pub struct FfprobeInspector {
    ffprobe_binary: String,
    ffmpeg_binary: String,
    timeout: Duration,
}

impl FfprobeInspector {
    pub fn new(ffprobe_binary: &str, ffmpeg_binary: &str, timeout: Duration) -> Self {
        Self {
            ffprobe_binary: ffprobe_binary.to_string(),
            ffmpeg_binary: ffmpeg_binary.to_string(),
            timeout,
        }
    }

    async fn ffprobe_streams(&self, source: &str, select: &str) -> Result<Vec<u8>, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe_binary);
        cmd.args(["-v", "error", "-print_format", "json", "-show_streams"])
            .args(["-select_streams", select])
            .arg(source);
        run_bounded(cmd, &self.ffprobe_binary, self.timeout).await
    }
}

/// 运行外部命令并收集 stdout，超时后子进程随 drop 被杀掉
async fn run_bounded(mut cmd: Command, tool: &str, limit: Duration) -> Result<Vec<u8>, ProbeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| ProbeError::Timeout(tool.to_string(), limit))?
        .map_err(|source| ProbeError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            tool: tool.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[async_trait]
impl StreamInspector for FfprobeInspector {
    async fn probe_video_codec(&self, source: &str) -> Result<Option<String>, ProbeError> {
        let json = self.ffprobe_streams(source, "v:0").await?;
        parse_video_codec(&json)
    }

    async fn probe_audio_tracks(&self, source: &str) -> Result<Vec<AudioTrack>, ProbeError> {
        let json = self.ffprobe_streams(source, "a").await?;
        parse_audio_tracks(&json)
    }

    async fn probe_filter_caps(&self) -> Result<FilterCaps, ProbeError> {
        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.args(["-hide_banner", "-filters"]);
        let listing = run_bounded(cmd, &self.ffmpeg_binary, self.timeout).await?;
        Ok(parse_filter_caps(&String::from_utf8_lossy(&listing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "mpeg2video"},
            {"index": 1, "codec_type": "audio", "codec_name": "mp2", "tags": {"language": "eng"}},
            {"index": 3, "codec_type": "data"},
            {"index": 4, "codec_type": "audio", "codec_name": "ac3", "tags": {"language": "spa"}},
            {"index": 5, "codec_type": "audio", "codec_name": "aac"}
        ]
    }"#;

    #[test]
    fn video_codec_is_first_video_stream() {
        assert_eq!(
            parse_video_codec(PROBE_JSON.as_bytes()).unwrap().as_deref(),
            Some("mpeg2video")
        );
        assert_eq!(parse_video_codec(br#"{"streams": []}"#).unwrap(), None);
        assert_eq!(parse_video_codec(b"{}").unwrap(), None);
    }

    #[test]
    fn audio_positions_are_ranks_not_stream_indices() {
        let tracks = parse_audio_tracks(PROBE_JSON.as_bytes()).unwrap();
        assert_eq!(
            tracks,
            vec![
                AudioTrack { pos: 0, index: 1, lang: "eng".into() },
                AudioTrack { pos: 1, index: 4, lang: "spa".into() },
                AudioTrack { pos: 2, index: 5, lang: "und".into() },
            ]
        );
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(matches!(parse_audio_tracks(b"not json"), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn filter_listing_detects_qsv_filters() {
        let listing = "\
Filters:
  T.. = Timeline support
 ... scale             V->V       Scale the input video size and/or convert the image format.
 ... scale_qsv         V->V       Quick Sync Video \"scaling and format conversion\"
 ... vpp_qsv           V->V       Quick Sync Video VPP.
";
        assert_eq!(
            parse_filter_caps(listing),
            FilterCaps { deinterlace_qsv: false, scale_qsv: true }
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let inspector = FfprobeInspector::new(
            "/nonexistent/ffprobe",
            "/nonexistent/ffmpeg",
            Duration::from_secs(1),
        );
        let err = inspector.probe_video_codec("udp://239.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
        assert!(inspector.probe_filter_caps().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_bounded(cmd, "sleep", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(..)));
    }
}
