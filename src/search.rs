use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, MetricKind};
use crate::config::{Aggregate, EncodeConfig};
use crate::ffmpeg;
use crate::process::{BatchExecutor, BatchTask};
use crate::reference::{FilterMode, ReferenceSample};
use crate::samples::SampleDescriptor;

const ENCODE_TIMEOUT: Duration = Duration::from_secs(600);
const MEASURE_TIMEOUT: Duration = Duration::from_secs(600);

/// One tested quality value with its measured scores and size estimate.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateResult {
    pub value: u32,
    pub aggregate: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub estimated_bitrate: f64,
    pub estimated_size: u64,
    pub measured_samples: usize,
}

impl CandidateResult {
    /// A candidate with no surviving sample scores carries NaN statistics,
    /// which never compare greater-or-equal to any target.
    #[must_use]
    pub fn from_scores(
        value: u32,
        scores: &[f64],
        aggregate: Aggregate,
        estimated_bitrate: f64,
        estimated_size: u64,
    ) -> Self {
        let min = scores.iter().copied().fold(f64::NAN, f64::min);
        let max = scores.iter().copied().fold(f64::NAN, f64::max);

        #[allow(clippy::as_conversions)]
        #[allow(clippy::cast_precision_loss)]
        let mean = if scores.is_empty() {
            f64::NAN
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        let aggregate = match aggregate {
            Aggregate::Min => min,
            Aggregate::Max => max,
            Aggregate::Mean => mean,
        };

        Self {
            value,
            aggregate,
            min,
            max,
            mean,
            estimated_bitrate,
            estimated_size,
            measured_samples: scores.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Converged,
    Exhausted,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchOutcome {
    pub verdict: Verdict,
    pub best: Option<CandidateResult>,
    pub trace: Vec<CandidateResult>,
    pub iterations: usize,
}

/// Measures one quality value across the prepared samples. The production
/// implementation shells out to ffmpeg; tests substitute canned scores.
pub trait CandidateEvaluator {
    fn evaluate(&mut self, value: u32) -> anyhow::Result<CandidateResult>;
}

#[derive(Clone, Copy, Debug)]
pub struct SearchParams {
    pub range: (u32, u32),
    pub target: f64,
    pub prefer_smaller: bool,
    pub max_iterations: usize,
    pub max_size: Option<u64>,
    /// Direction of the quality scale; false for the inverted scales where
    /// a larger value means a larger file.
    pub larger_means_smaller: bool,
}

/// Binary search for the quality value with the smallest estimated output
/// that still meets the target. Bounds only move inward, tested values are
/// never re-measured, and a size ceiling beats any score.
pub fn run(
    params: &SearchParams,
    evaluator: &mut dyn CandidateEvaluator,
    mut on_candidate: impl FnMut(&CandidateResult),
) -> anyhow::Result<SearchOutcome> {
    // Signed bounds let the low end step below zero and terminate the
    // loop naturally.
    let mut low = i64::from(params.range.0);
    let mut high = i64::from(params.range.1);
    let mut tested: BTreeMap<u32, CandidateResult> = BTreeMap::new();
    let mut best: Option<CandidateResult> = None;
    let mut converged = false;
    let mut iterations = 0;

    while low <= high && iterations < params.max_iterations {
        let value = u32::try_from((low + high) / 2)
            .context("Quality search bounds left the valid range")?;

        let result = if let Some(result) = tested.get(&value) {
            debug!("Reusing measurement for value {value}");
            result.clone()
        } else {
            iterations += 1;
            let result = evaluator
                .evaluate(value)
                .with_context(|| format!("Unable to evaluate quality value {value}"))?;

            on_candidate(&result);
            tested.insert(value, result.clone());
            result
        };

        let within_ceiling = params
            .max_size
            .is_none_or(|ceiling| result.estimated_size <= ceiling);

        if !within_ceiling {
            info!(
                "Value {value} exceeds the size ceiling, moving toward smaller output"
            );
            shrink_toward_smaller(&mut low, &mut high, value, params.larger_means_smaller);
        } else if result.measured_samples > 0 && result.aggregate >= params.target {
            debug!(
                "Value {value} meets the target ({:.3} >= {:.3})",
                result.aggregate, params.target
            );

            // Every qualifying candidate found later in the search replaces
            // the previous best.
            best = Some(result);

            if params.prefer_smaller {
                shrink_toward_smaller(&mut low, &mut high, value, params.larger_means_smaller);
            } else {
                converged = true;
                break;
            }
        } else {
            if result.measured_samples == 0 {
                warn!("No sample of value {value} could be measured");
            }

            grow_toward_quality(&mut low, &mut high, value, params.larger_means_smaller);
        }
    }

    let verdict = if best.is_some() {
        Verdict::Converged
    } else if tested.values().any(|result| result.measured_samples > 0) {
        Verdict::Exhausted
    } else {
        Verdict::Failed
    };

    if verdict == Verdict::Exhausted {
        // Best effort: the highest-scoring measured candidate that stayed
        // within the size ceiling. The caller may still apply it, subject
        // to its own size-reduction gate.
        best = tested
            .values()
            .filter(|result| result.measured_samples > 0)
            .filter(|result| {
                params
                    .max_size
                    .is_none_or(|ceiling| result.estimated_size <= ceiling)
            })
            .max_by(|a, b| a.aggregate.total_cmp(&b.aggregate))
            .cloned();
    }

    debug!(
        "Search finished after {iterations} iterations: {verdict:?}{}",
        if converged { "" } else { " (bounds or cap)" }
    );

    Ok(SearchOutcome {
        verdict,
        best,
        trace: tested.into_values().collect(),
        iterations,
    })
}

fn shrink_toward_smaller(low: &mut i64, high: &mut i64, value: u32, larger_means_smaller: bool) {
    if larger_means_smaller {
        *low = i64::from(value) + 1;
    } else {
        *high = i64::from(value) - 1;
    }
}

fn grow_toward_quality(low: &mut i64, high: &mut i64, value: u32, larger_means_smaller: bool) {
    if larger_means_smaller {
        *high = i64::from(value) - 1;
    } else {
        *low = i64::from(value) + 1;
    }
}

/// Subprocess-backed evaluator: encodes every sample at the candidate value
/// with the same filter mode its reference used, then measures each encode
/// against its reference.
pub struct EncodeEvaluator<'a> {
    pub asset_path: &'a Path,
    pub asset_duration: f64,
    pub pairs: &'a [(SampleDescriptor, ReferenceSample)],
    pub encode: &'a EncodeConfig,
    pub capabilities: &'a Capabilities,
    pub preset: &'a str,
    pub aggregate: Aggregate,
    pub scratch: &'a Path,
    pub ffmpeg: &'a Path,
    pub metric_tool: &'a Path,
    pub executor: &'a BatchExecutor,
    pub metric_threads: usize,
}

impl EncodeEvaluator<'_> {
    fn encode_samples(&self, value: u32) -> anyhow::Result<Vec<usize>> {
        let family = self.capabilities.family;
        let preset = family.preset_arg().map(|arg| (arg, self.preset));

        let tasks = self
            .pairs
            .iter()
            .enumerate()
            .map(|(index, (sample, reference))| {
                let software_only = reference.filter_mode == FilterMode::SoftwareFallback;

                BatchTask {
                    id: index,
                    program: self.ffmpeg.to_path_buf(),
                    args: ffmpeg::encode_args(
                        &sample.input(self.asset_path),
                        self.encode.filter_chain(software_only).as_deref(),
                        &self.encode.encoder,
                        &self.encode.params,
                        family.quality_arg(),
                        value,
                        preset,
                        &self.test_path(sample, value),
                    ),
                    timeout: ENCODE_TIMEOUT,
                }
            })
            .collect();

        let results = self.executor.run(tasks)?;

        Ok((0..self.pairs.len())
            .filter(|index| {
                let encoded = results
                    .get(index)
                    .is_some_and(crate::process::BatchTaskResult::success)
                    && std::fs::metadata(self.test_path(&self.pairs[*index].0, value))
                        .is_ok_and(|metadata| metadata.len() > 0);

                if !encoded {
                    warn!(
                        "Test encode at {:.1}s failed for value {value}",
                        self.pairs[*index].0.position
                    );
                }

                encoded
            })
            .collect())
    }

    fn measure_samples(&self, encoded: &[usize], value: u32) -> anyhow::Result<Vec<f64>> {
        let metric = self.capabilities.metric;

        let tasks = encoded
            .iter()
            .map(|&index| {
                let (sample, reference) = &self.pairs[index];

                BatchTask {
                    id: index,
                    program: self.metric_tool.to_path_buf(),
                    args: ffmpeg::measure_args(
                        &reference.path,
                        &self.test_path(sample, value),
                        metric,
                        &self.log_path(sample, value),
                        self.metric_threads,
                    ),
                    timeout: MEASURE_TIMEOUT,
                }
            })
            .collect();

        let results = self.executor.run(tasks)?;
        let mut scores = vec![];

        for &index in encoded {
            let (sample, _) = &self.pairs[index];

            let Some(result) = results.get(&index).filter(|result| result.success()) else {
                warn!(
                    "Measurement at {:.1}s failed for value {value}",
                    sample.position
                );
                continue;
            };

            let score = match metric {
                MetricKind::Vmaf => {
                    let log_path = self.log_path(sample, value);
                    let score = std::fs::read_to_string(&log_path)
                        .context("Unable to read the VMAF log")
                        .and_then(|log| ffmpeg::parse_vmaf_log(&log))
                        .map(|frames| mean(&frames));
                    let _ = std::fs::remove_file(&log_path);
                    score
                }
                MetricKind::Ssim => ffmpeg::parse_ssim_score(&result.output)
                    .context("Unable to parse the SSIM summary"),
            };

            match score {
                Ok(score) => scores.push(score),
                Err(err) => warn!(
                    "Discarding sample at {:.1}s for value {value}: {err:#}",
                    sample.position
                ),
            }
        }

        Ok(scores)
    }

    fn test_path(&self, sample: &SampleDescriptor, value: u32) -> std::path::PathBuf {
        self.scratch.join(format!("test-{}-{value}.mkv", sample.key))
    }

    fn log_path(&self, sample: &SampleDescriptor, value: u32) -> std::path::PathBuf {
        self.scratch.join(format!("vmaf-{}-{value}.json", sample.key))
    }

    /// Project the full-length output size from the sampled encodes.
    fn estimate(&self, value: u32) -> (f64, u64) {
        let mut bytes = 0_u64;
        let mut seconds = 0.0;

        for (sample, _) in self.pairs {
            if let Ok(metadata) = std::fs::metadata(self.test_path(sample, value)) {
                bytes += metadata.len();
                seconds += sample.duration;
            }
        }

        if seconds <= 0.0 {
            return (0.0, 0);
        }

        #[allow(clippy::as_conversions)]
        #[allow(clippy::cast_precision_loss)]
        let bitrate = bytes as f64 * 8.0 / seconds;

        #[allow(clippy::as_conversions)]
        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let size = (bitrate * self.asset_duration / 8.0) as u64;

        (bitrate, size)
    }

    fn cleanup(&self, value: u32) {
        for (sample, _) in self.pairs {
            let _ = std::fs::remove_file(self.test_path(sample, value));
        }
    }
}

impl CandidateEvaluator for EncodeEvaluator<'_> {
    fn evaluate(&mut self, value: u32) -> anyhow::Result<CandidateResult> {
        let encoded = self.encode_samples(value)?;
        let scores = self.measure_samples(&encoded, value)?;
        let (estimated_bitrate, estimated_size) = self.estimate(value);

        self.cleanup(value);

        Ok(CandidateResult::from_scores(
            value,
            &scores,
            self.aggregate,
            estimated_bitrate,
            estimated_size,
        ))
    }
}

#[allow(clippy::as_conversions)]
#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct StubEvaluator {
        score: Box<dyn Fn(u32) -> f64>,
        size: Box<dyn Fn(u32) -> u64>,
        evaluated: Vec<u32>,
    }

    impl StubEvaluator {
        fn passing_all(score: f64) -> Self {
            Self::with_score(move |_| score)
        }

        fn with_score(score: impl Fn(u32) -> f64 + 'static) -> Self {
            Self {
                score: Box::new(score),
                // larger value, smaller file; value 0 is a valid candidate
                size: Box::new(|value| 10_000_000 / (u64::from(value) + 1)),
                evaluated: vec![],
            }
        }
    }

    impl CandidateEvaluator for StubEvaluator {
        fn evaluate(&mut self, value: u32) -> anyhow::Result<CandidateResult> {
            self.evaluated.push(value);
            let score = (self.score)(value);

            Ok(CandidateResult {
                value,
                aggregate: score,
                min: score,
                max: score,
                mean: score,
                estimated_bitrate: 1_000_000.0,
                estimated_size: (self.size)(value),
                measured_samples: 3,
            })
        }
    }

    fn params(range: (u32, u32), target: f64, prefer_smaller: bool) -> SearchParams {
        SearchParams {
            range,
            target,
            prefer_smaller,
            max_iterations: 10,
            max_size: None,
            larger_means_smaller: true,
        }
    }

    #[test]
    fn prefer_smaller_narrows_to_the_top_of_an_all_passing_range() {
        let mut evaluator = StubEvaluator::passing_all(96.0);
        let outcome = run(&params((18, 28), 95.0, true), &mut evaluator, |_| ())
            .expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Converged);
        assert_eq!(outcome.best.expect("No best candidate").value, 28);
    }

    #[test]
    fn stop_on_first_pass_converges_on_the_first_midpoint() {
        let mut evaluator = StubEvaluator::passing_all(96.0);
        let outcome = run(&params((18, 28), 95.0, false), &mut evaluator, |_| ())
            .expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Converged);
        assert_eq!(outcome.best.expect("No best candidate").value, 23);
        assert_eq!(evaluator.evaluated, vec![23]);
    }

    #[test]
    fn threshold_in_range_finds_the_largest_passing_value() {
        // values up to 24 meet the target, 25 and above fall short
        let mut evaluator =
            StubEvaluator::with_score(|value| if value <= 24 { 95.5 } else { 93.0 });
        let outcome = run(&params((16, 32), 95.0, true), &mut evaluator, |_| ())
            .expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Converged);
        assert_eq!(outcome.best.expect("No best candidate").value, 24);
    }

    #[test]
    fn values_are_never_measured_twice_and_the_cap_holds() {
        let mut evaluator = StubEvaluator::with_score(|_| 90.0);
        let outcome = run(&params((0, 51), 95.0, true), &mut evaluator, |_| ())
            .expect("Search failed");

        assert!(outcome.iterations <= 10);

        // narrowing walks all the way down to the bottom of the scale
        assert!(evaluator.evaluated.contains(&0));

        let unique: BTreeSet<u32> = evaluator.evaluated.iter().copied().collect();
        assert_eq!(unique.len(), evaluator.evaluated.len());
    }

    #[test]
    fn nothing_passing_is_exhausted_with_the_best_scoring_fallback() {
        let mut evaluator = StubEvaluator::with_score(|value| 94.0 - f64::from(value) * 0.1);
        let outcome = run(&params((18, 28), 95.0, true), &mut evaluator, |_| ())
            .expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Exhausted);

        let best = outcome.best.expect("No fallback candidate");
        let top = evaluator
            .evaluated
            .iter()
            .copied()
            .fold(f64::NAN, |acc, value| acc.max(94.0 - f64::from(value) * 0.1));
        assert!((best.aggregate - top).abs() < 1e-9);
    }

    #[test]
    fn size_ceiling_beats_any_score() {
        let mut evaluator = StubEvaluator::passing_all(99.0);
        let mut params = params((18, 28), 95.0, true);
        params.max_size = Some(1);

        let outcome = run(&params, &mut evaluator, |_| ()).expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Exhausted);
        assert!(outcome.best.is_none());

        // the bounds only moved up, away from larger outputs
        let mut previous = 0;
        for value in &evaluator.evaluated {
            assert!(*value > previous);
            previous = *value;
        }
    }

    #[test]
    fn unmeasurable_candidates_yield_a_failed_verdict() {
        struct Unmeasurable;

        impl CandidateEvaluator for Unmeasurable {
            fn evaluate(&mut self, value: u32) -> anyhow::Result<CandidateResult> {
                Ok(CandidateResult::from_scores(value, &[], Aggregate::Min, 0.0, 0))
            }
        }

        let outcome = run(&params((18, 28), 95.0, true), &mut Unmeasurable, |_| ())
            .expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Failed);
        assert!(outcome.best.is_none());
    }

    #[test]
    fn inverted_scales_narrow_downward_after_a_pass() {
        let mut evaluator = StubEvaluator::passing_all(96.0);
        let mut params = params((35, 70), 95.0, true);
        params.larger_means_smaller = false;

        let outcome = run(&params, &mut evaluator, |_| ()).expect("Search failed");

        assert_eq!(outcome.verdict, Verdict::Converged);
        assert_eq!(outcome.best.expect("No best candidate").value, 35);
    }

    #[test]
    fn aggregate_statistics_cover_min_max_mean() {
        let result = CandidateResult::from_scores(
            20,
            &[94.0, 96.0, 98.0],
            Aggregate::Min,
            1_000_000.0,
            500_000,
        );

        assert!((result.aggregate - 94.0).abs() < f64::EPSILON);
        assert!((result.min - 94.0).abs() < f64::EPSILON);
        assert!((result.max - 98.0).abs() < f64::EPSILON);
        assert!((result.mean - 96.0).abs() < f64::EPSILON);
        assert_eq!(result.measured_samples, 3);
    }
}
