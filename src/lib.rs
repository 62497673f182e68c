use anyhow::Context;
use indicatif::ProgressBar;
use prettytable::{row, Table};
use serde::Serialize;
use tracing::{info, warn};

pub mod asset;
pub mod capabilities;
pub mod config;
pub mod ffmpeg;
pub mod outcome;
pub mod process;
pub mod reference;
pub mod samples;
pub mod search;
pub mod target;
pub mod util;

use crate::config::Config;
use crate::outcome::Reason;
use crate::process::BatchExecutor;
use crate::search::{CandidateResult, SearchParams, Verdict};
use crate::target::QualityTarget;
use crate::util::HumanBitrate;

/// The full result of a run: the outcome code, the target that was chased,
/// the chosen candidate (if any), and the trace of every tested value.
#[derive(Clone, Debug, Serialize)]
pub struct SearchReport {
    pub reason: Reason,
    pub target: Option<QualityTarget>,
    pub verdict: Option<Verdict>,
    pub chosen: Option<CandidateResult>,
    /// The full encoder parameter list with the chosen quality and preset
    /// written in, present only when the result was applied.
    pub parameters: Option<Vec<String>>,
    pub trace: Vec<CandidateResult>,
}

impl SearchReport {
    fn aborted(reason: Reason) -> Self {
        Self {
            reason,
            target: None,
            verdict: None,
            chosen: None,
            parameters: None,
            trace: vec![],
        }
    }

    /// Render the candidate trace as a table on stdout.
    pub fn print_trace(&self) {
        if self.trace.is_empty() {
            return;
        }

        let mut table = Table::new();
        table.set_titles(row![
            "Value", "Aggregate", "Minimum", "Maximum", "Mean", "Bitrate", "Est. Size"
        ]);

        for candidate in &self.trace {
            #[allow(clippy::as_conversions)]
            #[allow(clippy::cast_precision_loss)]
            let size = candidate.estimated_size as f64 / 1_000_000.0;

            table.add_row(row![
                candidate.value,
                format!("{:.3}", candidate.aggregate),
                format!("{:.3}", candidate.min),
                format!("{:.3}", candidate.max),
                format!("{:.3}", candidate.mean),
                HumanBitrate(candidate.estimated_bitrate).to_string(),
                format!("{size:.1} MB"),
            ]);
        }

        table.printstd();
    }
}

pub fn run(config: &Config) -> anyhow::Result<SearchReport> {
    anyhow::ensure!(
        config.source.is_file(),
        "Source video {:?} does not exist",
        config.source
    );

    let scratch =
        util::ScratchDir::new(&config.scratch_base()).context("Unable to create scratch directory")?;

    let asset =
        asset::probe(&config.ffprobe(), &config.source).context("Unable to probe the source video")?;

    info!(
        "Source: {}x{} {} at {}, {:.1}s",
        asset.width,
        asset.height,
        asset.codec,
        asset
            .bitrate
            .map_or_else(|| "unknown bitrate".to_owned(), |bitrate| {
                #[allow(clippy::as_conversions)]
                #[allow(clippy::cast_precision_loss)]
                let bitrate = bitrate as f64;
                HumanBitrate(bitrate).to_string()
            }),
        asset.duration
    );

    let positions = match samples::plan_positions(asset.duration, config.samples, config.sample_duration)
    {
        Ok(positions) => positions,
        Err(reason) => {
            warn!("Source cannot be sampled: {reason}");
            return Ok(SearchReport::aborted(reason));
        }
    };

    let encode = config.encode_config();

    if outcome::already_optimal(
        &asset,
        &config.encoder,
        capabilities::infer_bit_depth(&encode.params),
    ) {
        info!("Source is already within its bitrate ceiling for the target codec");
        return Ok(SearchReport::aborted(Reason::AlreadyOptimal));
    }

    let capabilities = capabilities::probe(
        &config.encoder,
        &encode.params,
        &config.metric_tool(),
        scratch.path(),
    );

    // Consumer hardware encoders cap how many sessions can run at once, so
    // the batch width follows the probed family rather than the raw worker
    // count.
    let executor = BatchExecutor::new(
        scratch.path(),
        capabilities.family.encode_jobs(config.effective_workers()),
    );

    let mut target = QualityTarget::compute(
        capabilities.metric,
        config.target,
        config.year,
        config.genre,
        asset.hdr || asset.wide_gamut,
        asset.width,
    );

    let descriptors = samples::extract(
        &config.source,
        &positions,
        config.sample_duration,
        scratch.path(),
        &config.ffmpeg,
        &executor,
    )
    .context("Unable to prepare samples")?;

    // An explicit target is taken at face value; only derived targets get
    // the luminance-based boost.
    if config.target.is_none() {
        let boost = samples::probe_darkness(
            &descriptors,
            &config.source,
            &config.ffprobe(),
            &executor,
        );
        target.apply_darkness_boost(boost);
    }

    info!("Chasing {} {:.4}", target.metric(), target.value());

    let search_range = search_range(config, &capabilities);

    let references = reference::generate(
        &descriptors,
        &config.source,
        &encode,
        &capabilities,
        &config.preset,
        search_range,
        scratch.path(),
        &config.ffmpeg,
        &executor,
    )
    .context("Unable to generate reference encodes")?;

    if references.is_empty() {
        warn!("No sample produced a usable reference encode");
        return Ok(SearchReport::aborted(Reason::ReferenceEncodeFailed));
    }

    let pairs: Vec<_> = references
        .into_iter()
        .filter_map(|reference| {
            descriptors
                .iter()
                .find(|sample| sample.key == reference.key)
                .map(|sample| (sample.clone(), reference))
        })
        .collect();

    let metric_tool = config.metric_tool();

    let mut evaluator = search::EncodeEvaluator {
        asset_path: &config.source,
        asset_duration: asset.duration,
        pairs: &pairs,
        encode: &encode,
        capabilities: &capabilities,
        preset: &config.preset,
        aggregate: config.aggregate,
        scratch: scratch.path(),
        ffmpeg: &config.ffmpeg,
        metric_tool: &metric_tool,
        executor: &executor,
        metric_threads: config.effective_workers(),
    };

    let params = SearchParams {
        range: search_range,
        target: target.value(),
        prefer_smaller: config.prefer_smaller,
        max_iterations: config.max_iterations,
        max_size: config.max_size,
        larger_means_smaller: capabilities.family.larger_means_smaller(),
    };

    let progress = ProgressBar::new(config.max_iterations.try_into().unwrap_or(u64::MAX));
    progress.set_style(util::create_progress_style(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} candidates ({smooth_eta})",
    )?);

    let result = search::run(&params, &mut evaluator, |candidate| {
        progress.inc(1);
        progress.set_message(format!("{:.3}", candidate.aggregate));
    })
    .context("Quality search failed")?;

    progress.finish_and_clear();

    let mut parameters = None;

    // An exhausted search still yields its best-effort candidate; only a
    // search with no usable measurement at all is a failure.
    let reason = match &result.best {
        Some(best) => {
            if result.verdict == Verdict::Exhausted {
                info!(
                    "No candidate met the target; applying best effort {} ({:.3})",
                    best.value, best.aggregate
                );
            }

            if outcome::meets_reduction(best.estimated_size, asset.size, config.min_size_reduction) {
                let mut applied = encode;
                outcome::apply(&mut applied, capabilities.family, best.value, &config.preset);

                parameters = Some(
                    applied
                        .params
                        .iter()
                        .flat_map(config::EncoderParam::tokens)
                        .collect(),
                );

                Reason::Applied(best.value)
            } else {
                info!("The projected saving is below the threshold, leaving the source alone");
                Reason::InsufficientReduction
            }
        }
        None => {
            warn!("No candidate could be measured");
            Reason::QualitySearchFailed
        }
    };

    Ok(SearchReport {
        reason,
        target: Some(target),
        verdict: Some(result.verdict),
        chosen: result.best,
        parameters,
        trace: result.trace,
    })
}

/// The integer interval to search, from explicit bounds where given and
/// the family default otherwise, clamped to the valid scale.
fn search_range(config: &Config, capabilities: &capabilities::Capabilities) -> (u32, u32) {
    let (default_low, default_high) = capabilities.family.default_search_range();
    let (scale_min, scale_max) = capabilities.family.quality_range();

    let low = config.min_quality.unwrap_or(default_low).max(scale_min);
    let high = config.max_quality.unwrap_or(default_high).min(scale_max);

    (low, high.max(low))
}
