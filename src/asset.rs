use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context};
use cached::{proc_macro::cached, UnboundCache};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Read-only descriptor of the source video. Never mutated by the search.
#[derive(Clone, Debug, Serialize)]
pub struct VideoAsset {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bitrate: Option<u64>,
    pub bit_depth: u8,
    pub hdr: bool,
    pub wide_gamut: bool,
    pub size: u64,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    bits_per_raw_sample: Option<String>,
    color_transfer: Option<String>,
    color_primaries: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[cached(
    result = true,
    ty = "UnboundCache<String, VideoAsset>",
    create = "{ UnboundCache::with_capacity(1) }",
    convert = r#"{ format!("{}|{}", ffprobe.to_string_lossy(), source.to_string_lossy()) }"#
)]
pub fn probe(ffprobe: &Path, source: &Path) -> anyhow::Result<VideoAsset> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(source)
        .output()
        .context("Unable to run ffprobe")?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe exited with status {} and output:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let json = std::str::from_utf8(&output.stdout)
        .context("Unable to decode ffprobe output as UTF-8")?;

    let fallback_size = std::fs::metadata(source).map(|metadata| metadata.len()).ok();

    let asset = parse(json, fallback_size)
        .with_context(|| format!("Unable to parse ffprobe output for {source:?}"))?;

    debug!(
        "Probed {source:?}: {}x{} {} {:.1}s",
        asset.width, asset.height, asset.codec, asset.duration
    );

    Ok(asset)
}

fn parse(json: &str, fallback_size: Option<u64>) -> anyhow::Result<VideoAsset> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).context("Unable to deserialize ffprobe JSON")?;

    let video = probe
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("No video stream found"))?;

    let format = probe.format.as_ref();

    let duration = format
        .and_then(|format| format.duration.as_deref())
        .and_then(|duration| duration.parse::<f64>().ok())
        .unwrap_or(0.0);

    let bitrate = format
        .and_then(|format| format.bit_rate.as_deref())
        .and_then(|bit_rate| bit_rate.parse::<u64>().ok());

    let size = format
        .and_then(|format| format.size.as_deref())
        .and_then(|size| size.parse::<u64>().ok())
        .or(fallback_size)
        .unwrap_or(0);

    let bit_depth = video
        .bits_per_raw_sample
        .as_deref()
        .and_then(|bits| bits.parse::<u8>().ok())
        .unwrap_or_else(|| {
            if video
                .pix_fmt
                .as_deref()
                .is_some_and(|pix_fmt| pix_fmt.contains("10"))
            {
                10
            } else {
                8
            }
        });

    let hdr = matches!(
        video.color_transfer.as_deref(),
        Some("smpte2084" | "arib-std-b67")
    );

    let wide_gamut = video.color_primaries.as_deref() == Some("bt2020");

    Ok(VideoAsset {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        codec: video.codec_name.clone().unwrap_or_default(),
        bitrate,
        bit_depth,
        hdr,
        wide_gamut,
        size,
    })
}
