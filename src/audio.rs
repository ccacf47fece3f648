use crate::params::{AudioSelector, ResolvedParams};
use crate::probe::AudioTrack;

const PREFERRED_LANGUAGE: &str = "spa";

/// 自动选择时的目标音轨位置
fn auto_position(tracks: &[AudioTrack]) -> usize {
    tracks
        .iter()
        .find(|t| t.lang.eq_ignore_ascii_case(PREFERRED_LANGUAGE))
        .or_else(|| tracks.first())
        .map(|t| t.pos)
        .unwrap_or(0)
}

/// 生成 `-map` 参数
///
/// 手动 map 覆盖优先于任何音轨选择；否则输出固定为一路视频加一路音频。
/// 覆盖值若不以 `-map` 开头，则每个 token 视为一个 map 规格。
pub fn select_audio_map(params: &ResolvedParams, tracks: &[AudioTrack]) -> Vec<String> {
    if let Some(manual) = &params.map_override {
        let tokens: Vec<&str> = manual.split_whitespace().collect();
        if tokens.first() == Some(&"-map") {
            return tokens.into_iter().map(String::from).collect();
        }
        return tokens
            .into_iter()
            .flat_map(|spec| ["-map".to_string(), spec.to_string()])
            .collect();
    }

    let position = match params.audio {
        AudioSelector::Auto => auto_position(tracks),
        AudioSelector::Index(n) => n.saturating_sub(1) as usize,
    };

    vec![
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        format!("0:a:{}", position),
    ]
}
