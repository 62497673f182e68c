use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::asset::VideoAsset;
use crate::capabilities::CodecFamily;
use crate::config::{EncodeConfig, EncoderParam};

/// Quality argument names across every encoder family, for scrubbing
/// stale entries before applying a new one.
const QUALITY_ARGS: [&str; 5] = ["-crf", "-cq", "-global_quality", "-qp", "-q:v"];
const PRESET_ARGS: [&str; 1] = ["-preset"];

/// The machine-readable outcome of a run. Every variant except `Applied`
/// leaves the encode configuration untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    AlreadyOptimal,
    InsufficientReduction,
    QualitySearchFailed,
    ReferenceEncodeFailed,
    ShortVideo,
    UnknownDuration,
    Applied(u32),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyOptimal => write!(f, "already_optimal"),
            Self::InsufficientReduction => write!(f, "insufficient_reduction"),
            Self::QualitySearchFailed => write!(f, "quality_search_failed"),
            Self::ReferenceEncodeFailed => write!(f, "reference_encode_failed"),
            Self::ShortVideo => write!(f, "short_video"),
            Self::UnknownDuration => write!(f, "unknown_duration"),
            Self::Applied(value) => write!(f, "applied({value})"),
        }
    }
}

/// Bitrate below which a source already in the target codec is not worth
/// re-encoding, by resolution class.
#[must_use]
pub const fn bitrate_ceiling(height: u32) -> u64 {
    if height >= 2160 {
        25_000_000
    } else if height >= 1080 {
        8_000_000
    } else if height >= 720 {
        4_000_000
    } else {
        2_500_000
    }
}

/// Codec an encoder identifier produces, for the already-optimal check.
#[must_use]
pub fn target_codec(encoder: &str) -> Option<&'static str> {
    if encoder.contains("265") || encoder.contains("hevc") {
        Some("hevc")
    } else if encoder.contains("av1") {
        Some("av1")
    } else if encoder.contains("264") {
        Some("h264")
    } else if encoder.contains("vp9") {
        Some("vp9")
    } else {
        None
    }
}

/// A source already in the target codec and bit depth at a modest bitrate
/// gains nothing from a re-encode.
#[must_use]
pub fn already_optimal(asset: &VideoAsset, encoder: &str, target_bit_depth: u8) -> bool {
    let Some(codec) = target_codec(encoder) else {
        return false;
    };

    let Some(bitrate) = asset.bitrate else {
        return false;
    };

    asset.codec == codec
        && asset.bit_depth == target_bit_depth
        && bitrate <= bitrate_ceiling(asset.height)
}

/// Whether the projected output is enough of a saving over the current
/// file to justify re-encoding.
#[must_use]
pub fn meets_reduction(estimated_size: u64, current_size: u64, min_percent: Option<f64>) -> bool {
    let Some(min_percent) = min_percent else {
        return true;
    };

    if current_size == 0 {
        return false;
    }

    #[allow(clippy::as_conversions)]
    #[allow(clippy::cast_precision_loss)]
    let reduction = 100.0 * (1.0 - estimated_size as f64 / current_size as f64);

    debug!("Estimated size reduction {reduction:.1}% (minimum {min_percent:.1}%)");

    reduction >= min_percent
}

/// Write the chosen quality and preset into the encoder parameter list,
/// replacing any stale quality or preset entries. Applying twice leaves a
/// single entry of each.
pub fn apply(encode: &mut EncodeConfig, family: CodecFamily, value: u32, preset: &str) {
    encode.params.retain(|param| {
        !QUALITY_ARGS.contains(&param.key.as_str()) && !PRESET_ARGS.contains(&param.key.as_str())
    });

    encode
        .params
        .push(EncoderParam::new(family.quality_arg(), &value.to_string()));

    if let Some(preset_arg) = family.preset_arg() {
        encode.params.push(EncoderParam::new(preset_arg, preset));
    }

    info!(
        "Applied {} {value} to the encode configuration",
        family.quality_arg()
    );
}
