use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::config::EncodeConfig;
use crate::ffmpeg;
use crate::process::{BatchExecutor, BatchTask};
use crate::samples::SampleDescriptor;

/// Quality margin of the reference encode over the best candidate the
/// search can produce.
const QUALITY_MARGIN: u32 = 6;

const REFERENCE_TIMEOUT: Duration = Duration::from_secs(600);

/// Which filter chain variant produced a sample's reference. Test encodes
/// of that sample must use the same variant, or the comparison measures
/// the filters instead of the encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Upstream,
    SoftwareFallback,
}

#[derive(Clone, Debug)]
pub struct ReferenceSample {
    pub key: String,
    pub path: PathBuf,
    pub filter_mode: FilterMode,
}

/// The near-lossless anchor value the references are encoded at: six steps
/// past the best-quality end of the search range, clamped to the scale.
#[must_use]
pub fn reference_quality(capabilities: &Capabilities, search_range: (u32, u32)) -> u32 {
    let family = capabilities.family;
    let (scale_min, scale_max) = family.quality_range();

    if family.larger_means_smaller() {
        search_range.0.saturating_sub(QUALITY_MARGIN).max(scale_min)
    } else {
        search_range.1.saturating_add(QUALITY_MARGIN).min(scale_max)
    }
}

/// Filter chain stages to attempt, in order. The software fallback only
/// exists when the upstream chain actually contains hardware-only stages.
fn stages(encode: &EncodeConfig) -> Vec<(FilterMode, Option<String>)> {
    let mut stages = vec![(FilterMode::Upstream, encode.filter_chain(false))];

    if encode.has_hardware_filters() {
        stages.push((FilterMode::SoftwareFallback, encode.filter_chain(true)));
    }

    stages
}

/// Encode a high-quality reference clip for each sample, falling back to a
/// software-only filter chain where the upstream chain fails. Samples that
/// fail every stage are dropped with a warning; the caller treats an empty
/// result as a fatal condition.
pub fn generate(
    samples: &[SampleDescriptor],
    asset_path: &Path,
    encode: &EncodeConfig,
    capabilities: &Capabilities,
    preset: &str,
    search_range: (u32, u32),
    scratch: &Path,
    ffmpeg_path: &Path,
    executor: &BatchExecutor,
) -> anyhow::Result<Vec<ReferenceSample>> {
    let family = capabilities.family;
    let quality = reference_quality(capabilities, search_range);
    let preset = family.preset_arg().map(|arg| (arg, preset));

    debug!("Encoding references at {} {quality}", family.quality_arg());

    let mut references: Vec<Option<ReferenceSample>> = vec![None; samples.len()];

    for (filter_mode, filter) in stages(encode) {
        let pending: Vec<usize> = (0..samples.len())
            .filter(|&index| references[index].is_none())
            .collect();

        if pending.is_empty() {
            break;
        }

        let tasks = pending
            .iter()
            .map(|&index| {
                let sample = &samples[index];
                let output = scratch.join(format!("reference-{}.mkv", sample.key));

                BatchTask {
                    id: index,
                    program: ffmpeg_path.to_path_buf(),
                    args: ffmpeg::encode_args(
                        &sample.input(asset_path),
                        filter.as_deref(),
                        &encode.encoder,
                        &encode.params,
                        family.quality_arg(),
                        quality,
                        preset,
                        &output,
                    ),
                    timeout: REFERENCE_TIMEOUT,
                }
            })
            .collect();

        let results = executor.run(tasks)?;

        for index in pending {
            let sample = &samples[index];
            let output = scratch.join(format!("reference-{}.mkv", sample.key));

            let encoded = results
                .get(&index)
                .is_some_and(crate::process::BatchTaskResult::success)
                && std::fs::metadata(&output).is_ok_and(|metadata| metadata.len() > 0);

            if encoded {
                references[index] = Some(ReferenceSample {
                    key: sample.key.clone(),
                    path: output,
                    filter_mode,
                });
            } else {
                let _ = std::fs::remove_file(&output);
                warn!(
                    "Reference encode for sample at {:.1}s failed ({filter_mode:?} filters)",
                    sample.position
                );
            }
        }
    }

    Ok(references.into_iter().flatten().collect())
}
