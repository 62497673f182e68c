use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use statrs::statistics::{Data, OrderStatistics};
use tracing::{debug, warn};

use crate::ffmpeg::{self, SampleInput};
use crate::outcome::Reason;
use crate::process::{BatchExecutor, BatchTask};

/// Videos shorter than this cannot be sampled reliably.
const MIN_DURATION: f64 = 60.0;

/// Lead-in/lead-out excluded from sampling, to avoid intros and credits.
const LEAD_FRACTION: f64 = 0.10;
const LEAD_MINIMUM: f64 = 30.0;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);
const LUMINANCE_TIMEOUT: Duration = Duration::from_secs(60);
const LUMINANCE_WINDOW: f64 = 2.0;
const LUMINANCE_PROBE_COUNT: usize = 3;

/// Valid YAVG range; values outside it are measurement noise.
const LUMA_VALID: std::ops::RangeInclusive<f64> = 16.0..=235.0;

#[derive(Clone, Debug, PartialEq)]
pub enum SampleSource {
    Clip(PathBuf),
    Seek(f64),
}

/// One temporal sample of the asset. Lives for the whole search; the clip
/// file (if any) sits in the scratch directory and is released with it.
#[derive(Clone, Debug)]
pub struct SampleDescriptor {
    pub key: String,
    pub position: f64,
    pub duration: f64,
    pub source: SampleSource,
}

impl SampleDescriptor {
    #[must_use]
    pub fn input<'a>(&'a self, asset_path: &'a Path) -> SampleInput<'a> {
        match &self.source {
            SampleSource::Clip(path) => SampleInput::Clip(path),
            SampleSource::Seek(position) => SampleInput::Seek {
                source: asset_path,
                position: *position,
                duration: self.duration,
            },
        }
    }
}

/// Spread sample positions evenly across the usable middle of the asset.
pub fn plan_positions(duration: f64, count: usize, sample_duration: f64) -> Result<Vec<f64>, Reason> {
    if duration <= 0.0 {
        return Err(Reason::UnknownDuration);
    }

    if duration < MIN_DURATION {
        return Err(Reason::ShortVideo);
    }

    let lead = (duration * LEAD_FRACTION).max(LEAD_MINIMUM);
    let usable = duration - 2.0 * lead - sample_duration;

    if usable <= 0.0 || count <= 1 {
        return Ok(vec![duration / 2.0]);
    }

    #[allow(clippy::as_conversions)]
    #[allow(clippy::cast_precision_loss)]
    let positions = (0..count)
        .map(|index| lead + usable * (index as f64 + 0.5) / count as f64)
        .collect();

    Ok(positions)
}

fn sample_key(source: &Path, position: f64, duration: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(format!("{position:.3}:{duration:.3}"));
    let digest = hasher.finalize();

    base16ct::lower::encode_string(&digest)[..16].to_owned()
}

/// Extract short stream-copied clips for each planned position. An existing
/// non-empty clip at the keyed path is reused as-is; a failed or empty
/// extraction falls back to seeking into the source for that sample.
pub fn extract(
    source: &Path,
    positions: &[f64],
    sample_duration: f64,
    scratch: &Path,
    ffmpeg_path: &Path,
    executor: &BatchExecutor,
) -> anyhow::Result<Vec<SampleDescriptor>> {
    let mut descriptors: Vec<SampleDescriptor> = positions
        .iter()
        .map(|&position| {
            let key = sample_key(source, position, sample_duration);
            let clip = scratch.join(format!("sample-{key}.mkv"));

            SampleDescriptor {
                key,
                position,
                duration: sample_duration,
                source: SampleSource::Clip(clip),
            }
        })
        .collect();

    let pending: Vec<(usize, PathBuf)> = descriptors
        .iter()
        .enumerate()
        .filter_map(|(index, descriptor)| match &descriptor.source {
            SampleSource::Clip(path) if !clip_is_valid(path) => Some((index, path.clone())),
            _ => None,
        })
        .collect();

    let tasks = pending
        .iter()
        .map(|(index, path)| BatchTask {
            id: *index,
            program: ffmpeg_path.to_path_buf(),
            args: ffmpeg::extract_args(
                source,
                descriptors[*index].position,
                sample_duration,
                path,
            ),
            timeout: EXTRACT_TIMEOUT,
        })
        .collect();

    let results = executor.run(tasks)?;

    for (index, path) in pending {
        let extracted = results
            .get(&index)
            .is_some_and(crate::process::BatchTaskResult::success)
            && clip_is_valid(&path);

        if !extracted {
            warn!(
                "Sample extraction at {:.1}s failed, falling back to seeking into the source",
                descriptors[index].position
            );

            let _ = std::fs::remove_file(&path);
            descriptors[index].source = SampleSource::Seek(descriptors[index].position);
        }
    }

    debug!("Prepared {} samples", descriptors.len());

    Ok(descriptors)
}

fn clip_is_valid(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|metadata| metadata.len() > 0)
}

/// Probe average scene luminance over up to three samples and map the
/// median to a darkness boost of 0 to 3 on the quality scale. Any probe
/// failure simply skips the boost.
#[must_use]
pub fn probe_darkness(
    samples: &[SampleDescriptor],
    asset_path: &Path,
    ffprobe_path: &Path,
    executor: &BatchExecutor,
) -> u32 {
    let tasks: Vec<BatchTask> = samples
        .iter()
        .take(LUMINANCE_PROBE_COUNT)
        .enumerate()
        .map(|(index, sample)| BatchTask {
            id: index,
            program: ffprobe_path.to_path_buf(),
            args: ffmpeg::luminance_args(&sample.input(asset_path), LUMINANCE_WINDOW),
            timeout: LUMINANCE_TIMEOUT,
        })
        .collect();

    let results = match executor.run(tasks) {
        Ok(results) => results,
        Err(err) => {
            warn!("Luminance probe failed: {err:#}");
            return 0;
        }
    };

    let averages: Vec<f64> = results
        .values()
        .filter(|result| result.success())
        .filter_map(|result| {
            let frames = ffmpeg::parse_luminance(&result.output).ok()?;

            let valid: Vec<f64> = frames
                .into_iter()
                .filter(|value| LUMA_VALID.contains(value))
                .collect();

            if valid.is_empty() {
                None
            } else {
                #[allow(clippy::as_conversions)]
                #[allow(clippy::cast_precision_loss)]
                let average = valid.iter().sum::<f64>() / valid.len() as f64;
                Some(average)
            }
        })
        .collect();

    if averages.is_empty() {
        debug!("Luminance probe produced no usable values, skipping darkness boost");
        return 0;
    }

    let mut averages = Data::new(averages);
    let median = averages.median();

    let boost = darkness_boost(median);
    debug!("Median scene luminance {median:.1} maps to darkness boost {boost}");

    boost
}

/// Darker content hides compression artifacts poorly; boost the target.
#[must_use]
pub const fn darkness_boost(median_luma: f64) -> u32 {
    if median_luma < 40.0 {
        3
    } else if median_luma < 60.0 {
        2
    } else if median_luma < 80.0 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_avoid_intros_and_credits() {
        let positions = plan_positions(3600.0, 3, 10.0).expect("Planning failed");

        assert_eq!(positions.len(), 3);

        let lead = 360.0;
        for position in &positions {
            assert!(*position >= lead);
            assert!(*position + 10.0 <= 3600.0 - lead);
        }

        // evenly spread: equidistant centers
        let gap_a = positions[1] - positions[0];
        let gap_b = positions[2] - positions[1];
        assert!((gap_a - gap_b).abs() < 1e-9);
    }

    #[test]
    fn single_sample_or_tight_span_uses_midpoint() {
        assert_eq!(
            plan_positions(3600.0, 1, 10.0).expect("Planning failed"),
            vec![1800.0]
        );

        // 90s video: leads of 30s each plus the sample leave no usable span
        assert_eq!(
            plan_positions(90.0, 3, 30.0).expect("Planning failed"),
            vec![45.0]
        );
    }

    #[test]
    fn short_and_unknown_durations_are_rejected_before_any_work() {
        assert_eq!(plan_positions(20.0, 3, 10.0), Err(Reason::ShortVideo));
        assert_eq!(plan_positions(0.0, 3, 10.0), Err(Reason::UnknownDuration));
        assert_eq!(plan_positions(-1.0, 3, 10.0), Err(Reason::UnknownDuration));
    }

    #[test]
    fn sample_keys_are_stable_and_position_sensitive() {
        let source = Path::new("/media/input.mkv");

        assert_eq!(
            sample_key(source, 100.0, 10.0),
            sample_key(source, 100.0, 10.0)
        );
        assert_ne!(
            sample_key(source, 100.0, 10.0),
            sample_key(source, 200.0, 10.0)
        );
        assert_ne!(
            sample_key(source, 100.0, 10.0),
            sample_key(Path::new("/media/other.mkv"), 100.0, 10.0)
        );
    }

    #[test]
    fn existing_valid_clips_are_reused_without_re_extraction() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 1);
        let source = Path::new("/media/input.mkv");
        let positions = plan_positions(3600.0, 2, 10.0).expect("Planning failed");

        for &position in &positions {
            let key = sample_key(source, position, 10.0);
            std::fs::write(dir.path().join(format!("sample-{key}.mkv")), b"clip")
                .expect("Unable to seed clip file");
        }

        // ffmpeg path is unrunnable; reuse must succeed without invoking it
        let descriptors = extract(
            source,
            &positions,
            10.0,
            dir.path(),
            Path::new("/nonexistent/ffmpeg"),
            &executor,
        )
        .expect("Extraction failed");

        for descriptor in &descriptors {
            assert!(matches!(descriptor.source, SampleSource::Clip(_)));
        }
    }

    #[test]
    fn failed_extraction_falls_back_to_seek() {
        let dir = tempfile::tempdir().expect("Unable to create temporary directory");
        let executor = BatchExecutor::new(dir.path(), 1);
        let source = Path::new("/media/input.mkv");
        let positions = vec![600.0];

        let descriptors = extract(
            source,
            &positions,
            10.0,
            dir.path(),
            Path::new("/nonexistent/ffmpeg"),
            &executor,
        )
        .expect("Extraction failed");

        assert_eq!(descriptors[0].source, SampleSource::Seek(600.0));
    }

    #[test]
    fn darkness_boost_mapping() {
        assert_eq!(darkness_boost(25.0), 3);
        assert_eq!(darkness_boost(45.0), 2);
        assert_eq!(darkness_boost(70.0), 1);
        assert_eq!(darkness_boost(120.0), 0);
    }
}
