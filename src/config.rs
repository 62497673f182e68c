use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Genre {
    None,
    Animation,
    Documentary,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Aggregate {
    /// Worst sample must pass (default)
    Min,
    /// Best sample must pass
    Max,
    /// Average across samples must pass
    Mean,
}

#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Target video encoder (e.g. libx265, hevc_nvenc, hevc_videotoolbox)
    #[arg(short, long, default_value = "libx265")]
    pub encoder: String,

    /// Encoder speed/quality preset to request alongside the chosen quality
    #[arg(short, long, default_value = "medium")]
    pub preset: String,

    /// Pre-decided video filter chain segment (repeatable, applied in order)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Pre-existing encoder parameter, as `key` or `key=value` (repeatable)
    #[arg(long = "encoder-param")]
    pub encoder_params: Vec<String>,

    /// Path to the encoding ffmpeg binary
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Path to a quality-metric-capable ffmpeg build (defaults to --ffmpeg)
    #[arg(long)]
    pub metric_ffmpeg: Option<PathBuf>,

    /// Minimum (highest quality) parameter value to try
    #[arg(long)]
    pub min_quality: Option<u32>,

    /// Maximum (lowest quality) parameter value to try
    #[arg(long)]
    pub max_quality: Option<u32>,

    /// Quality target override; otherwise derived from content attributes
    #[arg(short, long)]
    pub target: Option<f64>,

    /// Release year, used for the content-aware target baseline
    #[arg(long)]
    pub year: Option<i32>,

    /// Genre classification, used for the content-aware target baseline
    #[arg(long, value_enum, default_value_t = Genre::None)]
    pub genre: Genre,

    /// Number of samples to measure per candidate
    #[arg(short, long, default_value_t = 3)]
    pub samples: usize,

    /// Duration of each sample in seconds
    #[arg(long, default_value_t = 10.0)]
    pub sample_duration: f64,

    /// Maximum number of search iterations
    #[arg(long, default_value_t = 10)]
    pub max_iterations: usize,

    /// Keep narrowing toward smaller files after the target is first met
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub prefer_smaller: bool,

    /// Sample-level score aggregation policy
    #[arg(long, value_enum, default_value_t = Aggregate::Min)]
    pub aggregate: Aggregate,

    /// Minimum estimated size reduction in percent for the result to apply
    #[arg(long)]
    pub min_size_reduction: Option<f64>,

    /// Reject candidates whose estimated output size exceeds this many bytes
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Number of parallel subprocess workers (0 = one per processing unit)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Scratch directory for temporary clips (defaults to the system temp dir)
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Source video file to analyze
    pub source: PathBuf,
}

impl Config {
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.workers
        }
    }

    #[must_use]
    pub fn metric_tool(&self) -> PathBuf {
        self.metric_ffmpeg
            .clone()
            .unwrap_or_else(|| self.ffmpeg.clone())
    }

    /// The ffprobe binary, resolved next to the configured ffmpeg.
    #[must_use]
    pub fn ffprobe(&self) -> PathBuf {
        self.ffmpeg
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("ffprobe"), |parent| parent.join("ffprobe"))
    }

    #[must_use]
    pub fn scratch_base(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    #[must_use]
    pub fn encode_config(&self) -> EncodeConfig {
        EncodeConfig {
            encoder: self.encoder.clone(),
            filters: self
                .filters
                .iter()
                .map(|spec| FilterSegment::new(spec))
                .collect(),
            params: self
                .encoder_params
                .iter()
                .map(|entry| EncoderParam::parse(entry))
                .collect(),
        }
    }
}

/// One segment of the already-decided video filter chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSegment {
    spec: String,
}

impl FilterSegment {
    #[must_use]
    pub fn new(spec: &str) -> Self {
        Self {
            spec: spec.to_owned(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Whether this segment only runs on hardware frames and cannot be part
    /// of a software decode pipeline.
    #[must_use]
    pub fn is_hardware(&self) -> bool {
        const HARDWARE_MARKERS: &[&str] = &[
            "_cuda",
            "_npp",
            "_qsv",
            "_vaapi",
            "_videotoolbox",
            "hwupload",
            "hwdownload",
            "hwmap",
        ];

        let name = self.spec.split('=').next().unwrap_or(&self.spec);

        HARDWARE_MARKERS
            .iter()
            .any(|marker| name.contains(marker))
    }
}

/// One typed entry in an encoder parameter list. Flags carry no value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderParam {
    pub key: String,
    pub value: Option<String>,
}

impl EncoderParam {
    #[must_use]
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_owned(),
            value: Some(value.to_owned()),
        }
    }

    #[must_use]
    pub fn flag(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            value: None,
        }
    }

    #[must_use]
    pub fn parse(entry: &str) -> Self {
        entry.split_once('=').map_or_else(
            || Self::flag(entry),
            |(key, value)| Self::new(key, value),
        )
    }

    /// Expand into command-line tokens.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.key.clone()];

        if let Some(value) = &self.value {
            tokens.push(value.clone());
        }

        tokens
    }
}

/// The host-side encode configuration: the designated encoder, the decided
/// filter chain, and the mutable encoder parameter list this crate writes
/// its chosen quality and preset entries into.
#[derive(Clone, Debug)]
pub struct EncodeConfig {
    pub encoder: String,
    pub filters: Vec<FilterSegment>,
    pub params: Vec<EncoderParam>,
}

impl EncodeConfig {
    /// The filter chain as an ffmpeg `-vf` argument, optionally with
    /// hardware-only segments stripped.
    #[must_use]
    pub fn filter_chain(&self, software_only: bool) -> Option<String> {
        let segments: Vec<&str> = self
            .filters
            .iter()
            .filter(|segment| !(software_only && segment.is_hardware()))
            .map(FilterSegment::spec)
            .collect();

        if segments.is_empty() {
            None
        } else {
            Some(segments.join(","))
        }
    }

    #[must_use]
    pub fn has_hardware_filters(&self) -> bool {
        self.filters.iter().any(FilterSegment::is_hardware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_param_parses_flags_and_values() {
        assert_eq!(
            EncoderParam::parse("-crf=22"),
            EncoderParam::new("-crf", "22")
        );
        assert_eq!(EncoderParam::parse("-an"), EncoderParam::flag("-an"));
        assert_eq!(
            EncoderParam::new("-preset", "slow").tokens(),
            vec!["-preset".to_owned(), "slow".to_owned()]
        );
    }

    #[test]
    fn filter_segment_detects_hardware_stages() {
        assert!(FilterSegment::new("scale_cuda=1920:1080").is_hardware());
        assert!(FilterSegment::new("hwupload").is_hardware());
        assert!(!FilterSegment::new("scale=1920:1080").is_hardware());
        assert!(!FilterSegment::new("hqdn3d=4").is_hardware());
    }

    #[test]
    fn filter_chain_strips_hardware_segments_when_asked() {
        let config = EncodeConfig {
            encoder: "hevc_nvenc".to_owned(),
            filters: vec![
                FilterSegment::new("yadif"),
                FilterSegment::new("scale_cuda=1280:720"),
            ],
            params: vec![],
        };

        assert!(config.has_hardware_filters());
        assert_eq!(
            config.filter_chain(false).as_deref(),
            Some("yadif,scale_cuda=1280:720")
        );
        assert_eq!(config.filter_chain(true).as_deref(), Some("yadif"));
    }

    #[test]
    fn filter_chain_is_none_when_empty() {
        let config = EncodeConfig {
            encoder: "libx265".to_owned(),
            filters: vec![],
            params: vec![],
        };

        assert!(config.filter_chain(false).is_none());
    }
}
