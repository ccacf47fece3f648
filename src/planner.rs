//! 根据通道参数与探测到的源编码推导 ffmpeg 解码 / 滤镜 / 编码参数
//!
//! `plan` 是纯函数：相同输入必然得到相同结果，探测在调用前完成。

use crate::params::{EncoderClass, Resolution, ResolvedParams};
use crate::probe::FilterCaps;

/// 按 16:9 裁掉上下黑边
const CINEMA_CROP: &str = "crop=iw:iw*9/16";

const AUDIO_PROFILE: [&str; 6] = ["-c:a", "aac", "-b:a", "128k", "-ar", "48000"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelinePlan {
    /// `-i` 之前的硬件 / 解码器参数
    pub pre_input: Vec<String>,
    pub filter: Vec<String>,
    pub encode: Vec<String>,
}

fn args(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

fn vf(chain: String) -> Vec<String> {
    vec!["-vf".to_string(), chain]
}

fn software_scale(resolution: Resolution) -> String {
    format!("scale={}", resolution)
}

fn cinema_chain() -> String {
    format!("{},{}", CINEMA_CROP, software_scale(Resolution::CINEMA))
}

/// QSV 硬件解码器，mpeg2video 的解码器名与编码名不一致
fn qsv_decoder(codec: &str) -> String {
    match codec {
        "mpeg2video" => "mpeg2_qsv".to_string(),
        other => format!("{}_qsv", other),
    }
}

/// CUVID 硬件解码器，不支持的编码返回 None
fn cuvid_decoder(codec: &str) -> Option<&'static str> {
    match codec {
        "h264" => Some("h264_cuvid"),
        "hevc" => Some("hevc_cuvid"),
        "mpeg2video" => Some("mpeg2_cuvid"),
        "mpeg4" => Some("mpeg4_cuvid"),
        "vc1" => Some("vc1_cuvid"),
        "vp8" => Some("vp8_cuvid"),
        "vp9" => Some("vp9_cuvid"),
        "av1" => Some("av1_cuvid"),
        "mjpeg" => Some("mjpeg_cuvid"),
        _ => None,
    }
}

/// 该编码策略是否支持 `screen` 裁切
pub fn honours_cinema_crop(encoder: &EncoderClass) -> bool {
    !matches!(encoder, EncoderClass::Cuda | EncoderClass::Nvenc)
}

pub fn encode_profile(encoder: &EncoderClass, bitrate: &str) -> Vec<String> {
    let codec: &[&str] = match encoder {
        EncoderClass::Cpu => &["-c:v", "libx264", "-preset", "veryfast", "-profile:v", "high"],
        EncoderClass::Qsv => &["-c:v", "h264_qsv", "-preset", "veryfast"],
        EncoderClass::X265 => &["-c:v", "libx265", "-preset", "veryfast"],
        EncoderClass::Amf => &["-c:v", "h264_amf", "-quality", "speed"],
        EncoderClass::Cuda | EncoderClass::Nvenc | EncoderClass::Unknown(_) => {
            &["-c:v", "h264_nvenc", "-preset", "p4"]
        }
    };

    let mut encode = args(codec);
    encode.extend(
        ["-b:v", bitrate, "-maxrate", bitrate, "-bufsize", bitrate, "-g", "50"]
            .iter()
            .map(|t| t.to_string()),
    );
    encode.extend(args(&AUDIO_PROFILE));
    encode
}

fn plan_cpu(params: &ResolvedParams) -> Vec<String> {
    let mut stages = Vec::new();
    if !params.deinterlace_disabled {
        stages.push("yadif".to_string());
    }
    if params.cinema_crop {
        stages.push(cinema_chain());
    } else {
        stages.push(software_scale(params.resolution));
    }
    vf(stages.join(","))
}

fn plan_qsv(params: &ResolvedParams, codec: Option<&str>, caps: FilterCaps) -> (Vec<String>, Vec<String>) {
    let mut pre_input = args(&[
        "-init_hw_device",
        "qsv=hw",
        "-filter_hw_device",
        "hw",
        "-hwaccel",
        "qsv",
        "-hwaccel_output_format",
        "qsv",
    ]);
    if let Some(codec) = codec {
        pre_input.push("-c:v".to_string());
        pre_input.push(qsv_decoder(codec));
    }

    let Resolution { width, height } = params.resolution;
    let hw_scale = format!("scale_qsv=w={}:h={}", width, height);
    let download = "hwdownload,format=nv12";

    let chain = if params.cinema_crop {
        format!("{},{}", download, cinema_chain())
    } else if params.deinterlace_disabled {
        if caps.scale_qsv {
            hw_scale
        } else {
            format!("{},{}", download, software_scale(params.resolution))
        }
    } else if caps.deinterlace_qsv && caps.scale_qsv {
        format!("deinterlace_qsv,{}", hw_scale)
    } else if caps.scale_qsv {
        format!("{},yadif,hwupload=extra_hw_frames=64,{}", download, hw_scale)
    } else {
        format!("{},yadif,{}", download, software_scale(params.resolution))
    };

    (pre_input, vf(chain))
}

fn plan_cuda(params: &ResolvedParams) -> (Vec<String>, Vec<String>) {
    let pre_input = args(&["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]);
    let chain = format!("yadif_cuda,scale_cuda={}", params.resolution);
    (pre_input, vf(chain))
}

fn plan_nvenc(params: &ResolvedParams, codec: Option<&str>) -> (Vec<String>, Vec<String>) {
    let Some(decoder) = codec.and_then(cuvid_decoder) else {
        // 无法确定硬件解码器时退回软件解码
        return (Vec::new(), vf(software_scale(params.resolution)));
    };

    let mut pre_input = args(&["-hwaccel", "cuda", "-c:v", decoder]);
    if !params.decoder_deinterlace_override && !params.deinterlace_disabled {
        pre_input.extend(args(&["-deint", "2", "-drop_second_field", "1"]));
    }
    pre_input.push("-resize".to_string());
    pre_input.push(format!("{}x{}", params.resolution.width, params.resolution.height));
    (pre_input, Vec::new())
}

fn plan_generic(params: &ResolvedParams) -> Vec<String> {
    if params.cinema_crop {
        vf(cinema_chain())
    } else {
        vf(software_scale(params.resolution))
    }
}

/// 推导一次启动的完整管线
///
/// `source_codec` 为探测得到的视频编码名，探测失败时为 None；
/// `caps` 仅在 qsv 下影响滤镜选择。
pub fn plan(params: &ResolvedParams, source_codec: Option<&str>, caps: FilterCaps) -> PipelinePlan {
    let codec = source_codec.filter(|c| !c.is_empty());
    let (pre_input, filter) = match &params.encoder {
        EncoderClass::Cpu => (Vec::new(), plan_cpu(params)),
        EncoderClass::Qsv => plan_qsv(params, codec, caps),
        EncoderClass::Cuda => plan_cuda(params),
        EncoderClass::Nvenc => plan_nvenc(params, codec),
        EncoderClass::X265 | EncoderClass::Amf | EncoderClass::Unknown(_) => {
            (Vec::new(), plan_generic(params))
        }
    };

    PipelinePlan {
        pre_input,
        filter,
        encode: encode_profile(&params.encoder, &params.bitrate),
    }
}
