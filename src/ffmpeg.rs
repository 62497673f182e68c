use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::capabilities::MetricKind;
use crate::config::EncoderParam;

/// Where a sample's frames come from: a pre-extracted clip, or a direct
/// seek into the original asset when extraction failed.
#[derive(Clone, Debug)]
pub enum SampleInput<'a> {
    Clip(&'a Path),
    Seek {
        source: &'a Path,
        position: f64,
        duration: f64,
    },
}

fn push(args: &mut Vec<String>, tokens: &[&str]) {
    args.extend(tokens.iter().map(|token| (*token).to_owned()));
}

/// Stream-copied, video-only clip extraction.
#[must_use]
pub fn extract_args(source: &Path, position: f64, duration: f64, output: &Path) -> Vec<String> {
    let mut args = vec![];

    push(&mut args, &["-y", "-hide_banner", "-loglevel", "error"]);
    push(&mut args, &["-ss", &format!("{position:.3}")]);
    push(&mut args, &["-i", &source.to_string_lossy()]);
    push(&mut args, &["-t", &format!("{duration:.3}")]);
    push(&mut args, &["-map", "0:v:0", "-c", "copy", "-an", "-sn"]);
    args.push(output.to_string_lossy().to_string());

    args
}

/// Encode one sample with the given quality value, reusing the upstream
/// parameter list so candidate and reference encodes share a pipeline.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn encode_args(
    input: &SampleInput<'_>,
    filter: Option<&str>,
    encoder: &str,
    params: &[EncoderParam],
    quality_arg: &str,
    quality: u32,
    preset: Option<(&str, &str)>,
    output: &Path,
) -> Vec<String> {
    let mut args = vec![];

    push(&mut args, &["-y", "-hide_banner", "-loglevel", "error"]);

    match input {
        SampleInput::Clip(path) => {
            push(&mut args, &["-i", &path.to_string_lossy()]);
        }
        SampleInput::Seek {
            source,
            position,
            duration,
        } => {
            push(&mut args, &["-ss", &format!("{position:.3}")]);
            push(&mut args, &["-i", &source.to_string_lossy()]);
            push(&mut args, &["-t", &format!("{duration:.3}")]);
        }
    }

    push(&mut args, &["-map", "0:v:0", "-an", "-sn"]);

    if let Some(filter) = filter {
        push(&mut args, &["-vf", filter]);
    }

    push(&mut args, &["-c:v", encoder]);

    for param in params {
        args.extend(param.tokens());
    }

    push(&mut args, &[quality_arg, &quality.to_string()]);

    if let Some((preset_arg, preset)) = preset {
        push(&mut args, &[preset_arg, preset]);
    }

    args.push(output.to_string_lossy().to_string());

    args
}

/// Compare a test encode against its reference through a filter complex.
/// VMAF writes a JSON log to `log_path`; SSIM reports through the captured
/// process output.
#[must_use]
pub fn measure_args(
    reference: &Path,
    distorted: &Path,
    metric: MetricKind,
    log_path: &Path,
    threads: usize,
) -> Vec<String> {
    let mut args = vec![];

    push(&mut args, &["-hide_banner"]);
    push(&mut args, &["-i", &reference.to_string_lossy()]);
    push(&mut args, &["-i", &distorted.to_string_lossy()]);

    let comparison = match metric {
        MetricKind::Vmaf => format!(
            "libvmaf=log_fmt=json:log_path={}:n_threads={threads}",
            escape_lavfi(&log_path.to_string_lossy())
        ),
        MetricKind::Ssim => "ssim".to_owned(),
    };

    let filters = [
        "[0:v]setpts=PTS-STARTPTS[reference]".to_owned(),
        "[1:v]setpts=PTS-STARTPTS[distorted]".to_owned(),
        format!("[distorted][reference]{comparison}"),
    ];

    push(&mut args, &["-lavfi", &filters.join(";")]);
    push(&mut args, &["-f", "null", "-"]);

    args
}

/// Per-frame scene statistics over a short window, used by the luminance
/// probe. Runs under ffprobe with a lavfi movie source.
#[must_use]
pub fn luminance_args(input: &SampleInput<'_>, window: f64) -> Vec<String> {
    let source = match input {
        SampleInput::Clip(path) => format!("movie={}", escape_lavfi(&path.to_string_lossy())),
        SampleInput::Seek {
            source, position, ..
        } => format!(
            "movie={}:seek_point={position:.3}",
            escape_lavfi(&source.to_string_lossy())
        ),
    };

    let mut args = vec![];

    push(&mut args, &["-v", "error", "-f", "lavfi"]);
    push(&mut args, &["-i", &format!("{source},signalstats")]);
    push(
        &mut args,
        &[
            "-show_entries",
            "frame_tags=lavfi.signalstats.YAVG",
            "-print_format",
            "json",
        ],
    );
    push(&mut args, &["-read_intervals", &format!("%+{window:.0}")]);

    args
}

fn escape_lavfi(path: &str) -> String {
    path.replace('\\', "\\\\").replace(':', "\\:")
}

#[derive(Deserialize)]
struct VmafLogMetrics {
    vmaf: f64,
}

#[derive(Deserialize)]
struct VmafLogFrame {
    metrics: VmafLogMetrics,
}

#[derive(Deserialize)]
struct VmafLog {
    frames: Vec<VmafLogFrame>,
}

/// Per-frame VMAF scores from the libvmaf JSON log.
pub fn parse_vmaf_log(json: &str) -> anyhow::Result<Vec<f64>> {
    let log: VmafLog = serde_json::from_str(json).context("Unable to parse libvmaf JSON log")?;

    Ok(log
        .frames
        .iter()
        .map(|frame| frame.metrics.vmaf)
        .collect())
}

/// The overall SSIM score from ffmpeg's summary line, e.g.
/// `[Parsed_ssim_0 ...] SSIM Y:0.987 U:0.991 V:0.990 All:0.988 (19.2)`.
#[must_use]
pub fn parse_ssim_score(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|line| line.contains("SSIM"))
        .filter_map(|line| {
            line.split_whitespace()
                .find_map(|token| token.strip_prefix("All:"))
                .and_then(|value| value.parse::<f64>().ok())
        })
        .last()
}

#[derive(Deserialize)]
struct SignalstatsTags {
    #[serde(rename = "lavfi.signalstats.YAVG")]
    yavg: Option<String>,
}

#[derive(Deserialize)]
struct SignalstatsFrame {
    tags: Option<SignalstatsTags>,
}

#[derive(Deserialize)]
struct SignalstatsLog {
    #[serde(default)]
    frames: Vec<SignalstatsFrame>,
}

/// Per-frame average luma values from the signalstats probe output.
pub fn parse_luminance(json: &str) -> anyhow::Result<Vec<f64>> {
    let log: SignalstatsLog =
        serde_json::from_str(json).context("Unable to parse signalstats JSON output")?;

    Ok(log
        .frames
        .iter()
        .filter_map(|frame| frame.tags.as_ref())
        .filter_map(|tags| tags.yavg.as_deref())
        .filter_map(|yavg| yavg.parse::<f64>().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extract_args_are_stream_copied_video_only() {
        let args = extract_args(
            Path::new("/media/input.mkv"),
            123.4,
            10.0,
            Path::new("/tmp/clip.mkv"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-ss 123.400 -i /media/input.mkv -t 10.000"));
        assert!(joined.contains("-map 0:v:0 -c copy -an -sn"));
        assert!(joined.ends_with("/tmp/clip.mkv"));
    }

    #[test]
    fn encode_args_include_filter_params_quality_and_preset() {
        let params = vec![EncoderParam::new("-profile:v", "main10")];

        let args = encode_args(
            &SampleInput::Clip(Path::new("/tmp/clip.mkv")),
            Some("hqdn3d=4"),
            "libx265",
            &params,
            "-crf",
            23,
            Some(("-preset", "medium")),
            Path::new("/tmp/out.mkv"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-vf hqdn3d=4"));
        assert!(joined.contains("-c:v libx265 -profile:v main10 -crf 23 -preset medium"));
    }

    #[test]
    fn encode_args_seek_fallback_seeks_into_source() {
        let args = encode_args(
            &SampleInput::Seek {
                source: Path::new("/media/input.mkv"),
                position: 600.0,
                duration: 10.0,
            },
            None,
            "hevc_nvenc",
            &[],
            "-cq",
            30,
            None,
            Path::new("/tmp/out.mkv"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-ss 600.000 -i /media/input.mkv -t 10.000"));
        assert!(joined.contains("-cq 30"));
        assert!(!joined.contains("-preset"));
    }

    #[test]
    fn measure_args_route_vmaf_to_log_file() {
        let args = measure_args(
            Path::new("/tmp/reference.mkv"),
            Path::new("/tmp/distorted.mkv"),
            MetricKind::Vmaf,
            Path::new("/tmp/score.json"),
            4,
        );

        let joined = args.join(" ");
        assert!(joined.contains("[distorted][reference]libvmaf=log_fmt=json:log_path=/tmp/score.json:n_threads=4"));
        assert!(joined.ends_with("-f null -"));
    }

    #[test]
    fn vmaf_log_path_colons_are_escaped() {
        let args = measure_args(
            Path::new("/tmp/reference.mkv"),
            Path::new("/tmp/distorted.mkv"),
            MetricKind::Vmaf,
            Path::new("/tmp/scratch:1/score.json"),
            4,
        );

        assert!(args
            .iter()
            .any(|arg| arg.contains("log_path=/tmp/scratch\\:1/score.json")));
    }

    #[test]
    fn measure_args_ssim_variant() {
        let args = measure_args(
            Path::new("/tmp/reference.mkv"),
            Path::new("/tmp/distorted.mkv"),
            MetricKind::Ssim,
            Path::new("/tmp/unused.json"),
            4,
        );

        assert!(args.join(" ").contains("[distorted][reference]ssim"));
    }

    #[test]
    fn parses_vmaf_log_frames() {
        let json = r#"{"frames": [
            {"metrics": {"vmaf": 93.1}},
            {"metrics": {"vmaf": 95.5}},
            {"metrics": {"vmaf": 97.0}}
        ]}"#;

        let scores = parse_vmaf_log(json).expect("Unable to parse VMAF log");
        assert_eq!(scores, vec![93.1, 95.5, 97.0]);
    }

    #[test]
    fn parses_ssim_summary_line() {
        let output = "frame I:1 ...\n[Parsed_ssim_0 @ 0x55] SSIM Y:0.987174 U:0.991 V:0.990 All:0.988321 (19.2)\n";
        let score = parse_ssim_score(output).expect("Unable to parse SSIM score");
        assert!((score - 0.988_321).abs() < 1e-9);

        assert!(parse_ssim_score("no score here").is_none());
    }

    #[test]
    fn parses_luminance_frames_and_ignores_missing_tags() {
        let json = r#"{"frames": [
            {"tags": {"lavfi.signalstats.YAVG": "42.51"}},
            {"tags": {}},
            {"tags": {"lavfi.signalstats.YAVG": "48.03"}}
        ]}"#;

        let values = parse_luminance(json).expect("Unable to parse signalstats output");
        assert_eq!(values.len(), 2);
        assert!((values[0] - 42.51).abs() < 1e-9);
    }

    #[test]
    fn lavfi_path_colons_are_escaped() {
        let args = luminance_args(&SampleInput::Clip(&PathBuf::from("C:/clips/a.mkv")), 2.0);
        assert!(args.iter().any(|arg| arg.contains("movie=C\\:/clips/a.mkv")));
    }
}
