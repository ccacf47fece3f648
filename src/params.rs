//! 通道参数解析：默认模板 + 覆盖字符串 => 每次启动独立的参数对象

use crate::config::ParamDefaults;
use std::fmt;

/// 编码策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderClass {
    Cpu,
    Qsv,
    Cuda,
    Nvenc,
    X265,
    Amf,
    /// 未识别的名称，按 nvenc 编码参数 + 通用软件缩放处理
    Unknown(String),
}

impl EncoderClass {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "qsv" => Self::Qsv,
            "cuda" => Self::Cuda,
            "nvenc" => Self::Nvenc,
            "x265" => Self::X265,
            "amf" => Self::Amf,
            _ => Self::Unknown(name.trim().to_string()),
        }
    }
}

impl fmt::Display for EncoderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Qsv => "qsv",
            Self::Cuda => "cuda",
            Self::Nvenc => "nvenc",
            Self::X265 => "x265",
            Self::Amf => "amf",
            Self::Unknown(name) => name,
        };
        f.write_str(name)
    }
}

/// 音轨选择方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSelector {
    /// 优先西班牙语音轨，否则取第一条
    Auto,
    /// 从 1 开始的音轨序号
    Index(u32),
}

impl AudioSelector {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Self::Auto;
        }
        value.parse().map(Self::Index).unwrap_or(Self::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const CINEMA: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    /// 解析 `width:height`
    pub fn parse(value: &str) -> Option<Self> {
        let (w, h) = value.trim().split_once(':')?;
        let width = w.trim().parse().ok().filter(|v| *v > 0)?;
        let height = h.trim().parse().ok().filter(|v| *v > 0)?;
        Some(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParams {
    pub deinterlace_disabled: bool,
    pub encoder: EncoderClass,
    /// 手动 map 覆盖，`auto` 视为未设置
    pub map_override: Option<String>,
    pub audio: AudioSelector,
    pub bitrate: String,
    pub resolution: Resolution,
    pub cinema_crop: bool,
    pub decoder_deinterlace_override: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn map_override(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("auto") {
        None
    } else {
        Some(value.to_string())
    }
}

/// 合并默认模板与覆盖字符串
///
/// 未识别的键被静默忽略；无法解析的 `scale` 保留默认值。
/// `defaults` 只读，每次调用都返回新的参数对象。
pub fn resolve(defaults: &ParamDefaults, overrides: &str) -> ResolvedParams {
    let fallback_resolution = Resolution::parse(&defaults.scale).unwrap_or(Resolution::CINEMA);
    let mut params = ResolvedParams {
        deinterlace_disabled: defaults.nodeint,
        encoder: EncoderClass::parse(&defaults.encoder),
        map_override: map_override(&defaults.map),
        audio: AudioSelector::parse(&defaults.audio),
        bitrate: defaults.bitrate.clone(),
        resolution: fallback_resolution,
        cinema_crop: defaults.screen,
        decoder_deinterlace_override: defaults.nodecdeint,
    };

    for pair in overrides.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "nodeint" => params.deinterlace_disabled = parse_flag(value),
            "encoder" => params.encoder = EncoderClass::parse(value),
            "map" => params.map_override = map_override(value),
            "audio" => params.audio = AudioSelector::parse(value),
            "bitrate" if !value.is_empty() => params.bitrate = value.to_string(),
            "scale" => {
                if let Some(resolution) = Resolution::parse(value) {
                    params.resolution = resolution;
                }
            }
            "screen" => params.cinema_crop = parse_flag(value),
            "nodecdeint" => params.decoder_deinterlace_override = parse_flag(value),
            _ => {}
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_override_yields_defaults() {
        let params = resolve(&ParamDefaults::default(), "");
        assert!(!params.deinterlace_disabled);
        assert_eq!(params.encoder, EncoderClass::Nvenc);
        assert_eq!(params.map_override, None);
        assert_eq!(params.audio, AudioSelector::Auto);
        assert_eq!(params.bitrate, "2500k");
        assert_eq!(params.resolution, Resolution { width: 1280, height: 720 });
        assert!(!params.cinema_crop);
        assert!(!params.decoder_deinterlace_override);
    }

    #[test]
    fn overrides_are_trimmed_and_applied() {
        let params = resolve(
            &ParamDefaults::default(),
            " encoder = qsv , nodeint=1,scale=1920:1080 ,audio=2, bitrate=4M,screen=yes,nodecdeint=true",
        );
        assert!(params.deinterlace_disabled);
        assert_eq!(params.encoder, EncoderClass::Qsv);
        assert_eq!(params.audio, AudioSelector::Index(2));
        assert_eq!(params.bitrate, "4M");
        assert_eq!(params.resolution, Resolution { width: 1920, height: 1080 });
        assert!(params.cinema_crop);
        assert!(params.decoder_deinterlace_override);
    }

    #[test]
    fn unknown_keys_and_malformed_pairs_are_ignored() {
        let params = resolve(&ParamDefaults::default(), "volume=11,garbage,,=x,scale=wide");
        assert_eq!(params, resolve(&ParamDefaults::default(), ""));
    }

    #[test]
    fn unknown_encoder_is_kept_as_unknown() {
        let params = resolve(&ParamDefaults::default(), "encoder=vaapi");
        assert_eq!(params.encoder, EncoderClass::Unknown("vaapi".to_string()));
    }

    #[test]
    fn map_auto_clears_a_default_override() {
        let defaults = ParamDefaults {
            map: "-map 0:1 -map 0:2".to_string(),
            ..ParamDefaults::default()
        };
        assert_eq!(resolve(&defaults, "").map_override.as_deref(), Some("-map 0:1 -map 0:2"));
        assert_eq!(resolve(&defaults, "map=auto").map_override, None);
    }

    #[test]
    fn defaults_template_is_not_mutated_between_channels() {
        let defaults = ParamDefaults::default();
        let first = resolve(&defaults, "encoder=cpu,scale=640:360,nodeint=1");
        let second = resolve(&defaults, "");
        assert_eq!(first.encoder, EncoderClass::Cpu);
        assert_eq!(second.encoder, EncoderClass::Nvenc);
        assert_eq!(second.resolution, Resolution::CINEMA);
        assert!(!second.deinterlace_disabled);
        assert_eq!(defaults.encoder, "nvenc");
    }

    #[test]
    fn audio_selector_parsing() {
        assert_eq!(AudioSelector::parse("AUTO"), AudioSelector::Auto);
        assert_eq!(AudioSelector::parse("3"), AudioSelector::Index(3));
        assert_eq!(AudioSelector::parse("spanish"), AudioSelector::Auto);
    }

    proptest! {
        #[test]
        fn bitrate_override_touches_only_bitrate(bitrate in "[0-9]{1,5}k") {
            let defaults = ParamDefaults::default();
            let base = resolve(&defaults, "");
            let params = resolve(&defaults, &format!("bitrate={}", bitrate));
            prop_assert_eq!(&params.bitrate, &bitrate);
            prop_assert_eq!(ResolvedParams { bitrate: base.bitrate.clone(), ..params }, base);
        }

        #[test]
        fn unknown_keys_never_change_the_result(key in "[a-z]{3,10}", value in "[a-z0-9:]{0,8}") {
            let known = ["nodeint", "encoder", "map", "audio", "bitrate", "scale", "screen", "nodecdeint"];
            prop_assume!(!known.contains(&key.as_str()));
            let defaults = ParamDefaults::default();
            prop_assert_eq!(
                resolve(&defaults, &format!("{}={}", key, value)),
                resolve(&defaults, "")
            );
        }

        #[test]
        fn scale_override_touches_only_resolution(w in 1u32..8000, h in 1u32..8000) {
            let defaults = ParamDefaults::default();
            let base = resolve(&defaults, "");
            let params = resolve(&defaults, &format!("scale={}:{}", w, h));
            prop_assert_eq!(params.resolution, Resolution { width: w, height: h });
            prop_assert_eq!(ResolvedParams { resolution: base.resolution, ..params }, base);
        }
    }
}
