use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EncoderParam;
use crate::process::run_with_timeout;

const METRIC_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Vmaf,
    Ssim,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vmaf => write!(f, "VMAF"),
            Self::Ssim => write!(f, "SSIM"),
        }
    }
}

/// Encoder families this crate knows how to drive. Each family controls
/// quality through a different argument, over a different numeric range,
/// and not always in the same direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecFamily {
    Cpu,
    Nvenc,
    Qsv,
    Vaapi,
    VideoToolbox,
}

impl CodecFamily {
    #[must_use]
    pub fn classify(encoder: &str) -> Self {
        if encoder.ends_with("_nvenc") {
            Self::Nvenc
        } else if encoder.ends_with("_qsv") {
            Self::Qsv
        } else if encoder.ends_with("_vaapi") {
            Self::Vaapi
        } else if encoder.ends_with("_videotoolbox") {
            Self::VideoToolbox
        } else {
            Self::Cpu
        }
    }

    #[must_use]
    pub const fn is_hardware(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    #[must_use]
    pub const fn quality_arg(self) -> &'static str {
        match self {
            Self::Cpu => "-crf",
            Self::Nvenc => "-cq",
            Self::Qsv => "-global_quality",
            Self::Vaapi => "-qp",
            Self::VideoToolbox => "-q:v",
        }
    }

    #[must_use]
    pub const fn preset_arg(self) -> Option<&'static str> {
        match self {
            Self::VideoToolbox => None,
            _ => Some("-preset"),
        }
    }

    /// The full usable range of the quality argument.
    #[must_use]
    pub const fn quality_range(self) -> (u32, u32) {
        match self {
            Self::Cpu | Self::Nvenc => (0, 51),
            Self::Qsv | Self::Vaapi => (1, 51),
            Self::VideoToolbox => (1, 100),
        }
    }

    /// Whether raising the parameter value shrinks the output. True for the
    /// CRF-like scales; VideoToolbox's quality scale runs the other way.
    #[must_use]
    pub const fn larger_means_smaller(self) -> bool {
        !matches!(self, Self::VideoToolbox)
    }

    /// Concurrent encode sessions the family can sustain. Consumer hardware
    /// encoders only allow a couple of simultaneous sessions, so batches
    /// for those families run narrower than the worker count.
    #[must_use]
    pub fn encode_jobs(self, workers: usize) -> usize {
        if self.is_hardware() {
            workers.clamp(1, 2)
        } else {
            workers
        }
    }

    /// Default search interval when the caller does not narrow it.
    #[must_use]
    pub const fn default_search_range(self) -> (u32, u32) {
        match self {
            Self::Cpu => (16, 32),
            Self::Nvenc | Self::Qsv | Self::Vaapi => (20, 36),
            Self::VideoToolbox => (35, 70),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Capabilities {
    pub family: CodecFamily,
    pub metric: MetricKind,
}

/// Inspect the upstream encode configuration and the metric tool. Metric
/// probe failure is not an error; it degrades the metric to SSIM.
pub fn probe(
    encoder: &str,
    params: &[EncoderParam],
    metric_tool: &Path,
    capture_dir: &Path,
) -> Capabilities {
    let family = CodecFamily::classify(encoder);
    let bit_depth = infer_bit_depth(params);

    let metric = if supports_vmaf(metric_tool, capture_dir) {
        MetricKind::Vmaf
    } else {
        info!("Metric tool lacks libvmaf support, degrading to SSIM");
        MetricKind::Ssim
    };

    debug!(
        "Probed capabilities: family {family:?}, {bit_depth}-bit, metric {metric}"
    );

    Capabilities { family, metric }
}

/// Target bit depth implied by the pre-existing encoder parameters.
#[must_use]
pub fn infer_bit_depth(params: &[EncoderParam]) -> u8 {
    const TEN_BIT_MARKERS: &[&str] = &["main10", "p010", "yuv420p10", "yuv422p10", "yuv444p10"];

    let ten_bit = params.iter().any(|param| {
        param.value.as_deref().is_some_and(|value| {
            TEN_BIT_MARKERS
                .iter()
                .any(|marker| value.contains(marker))
        })
    });

    if ten_bit {
        10
    } else {
        8
    }
}

fn supports_vmaf(metric_tool: &Path, capture_dir: &Path) -> bool {
    let capture_path = capture_dir.join("metric-probe.log");

    let result = run_with_timeout(
        metric_tool,
        &["-hide_banner".to_owned(), "-filters".to_owned()],
        METRIC_PROBE_TIMEOUT,
        &capture_path,
    );

    result.success() && result.output.contains("libvmaf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_encoder_families() {
        assert_eq!(CodecFamily::classify("libx265"), CodecFamily::Cpu);
        assert_eq!(CodecFamily::classify("libsvtav1"), CodecFamily::Cpu);
        assert_eq!(CodecFamily::classify("hevc_nvenc"), CodecFamily::Nvenc);
        assert_eq!(CodecFamily::classify("av1_qsv"), CodecFamily::Qsv);
        assert_eq!(CodecFamily::classify("hevc_vaapi"), CodecFamily::Vaapi);
        assert_eq!(
            CodecFamily::classify("hevc_videotoolbox"),
            CodecFamily::VideoToolbox
        );
    }

    #[test]
    fn quality_semantics_per_family() {
        assert_eq!(CodecFamily::Cpu.quality_arg(), "-crf");
        assert_eq!(CodecFamily::Qsv.quality_arg(), "-global_quality");
        assert!(CodecFamily::Cpu.larger_means_smaller());
        assert!(!CodecFamily::VideoToolbox.larger_means_smaller());
        assert!(CodecFamily::VideoToolbox.preset_arg().is_none());
        assert!(!CodecFamily::Cpu.is_hardware());
        assert!(CodecFamily::Vaapi.is_hardware());
    }

    #[test]
    fn hardware_families_cap_their_encode_sessions() {
        assert_eq!(CodecFamily::Cpu.encode_jobs(16), 16);
        assert_eq!(CodecFamily::Nvenc.encode_jobs(16), 2);
        assert_eq!(CodecFamily::Vaapi.encode_jobs(1), 1);
    }

    #[test]
    fn bit_depth_inferred_from_existing_params() {
        assert_eq!(infer_bit_depth(&[]), 8);

        assert_eq!(
            infer_bit_depth(&[EncoderParam::new("-profile:v", "main10")]),
            10
        );

        assert_eq!(
            infer_bit_depth(&[EncoderParam::new("-pix_fmt", "p010le")]),
            10
        );

        assert_eq!(
            infer_bit_depth(&[
                EncoderParam::new("-pix_fmt", "yuv420p"),
                EncoderParam::flag("-an"),
            ]),
            8
        );
    }

    #[test]
    fn missing_metric_tool_degrades_to_ssim() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");

        let capabilities = probe(
            "libx265",
            &[],
            Path::new("/nonexistent/ffmpeg"),
            dir.path(),
        );

        assert_eq!(capabilities.metric, MetricKind::Ssim);
        assert_eq!(capabilities.family, CodecFamily::Cpu);
    }
}
