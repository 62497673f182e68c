use serde::Serialize;
use tracing::{debug, info};

use crate::capabilities::MetricKind;
use crate::config::Genre;

const VMAF_CEILING: f64 = 97.0;
const VMAF_BOOST_CAP: f64 = 98.0;
const SSIM_FLOOR: f64 = 0.950;
const SSIM_CEILING: f64 = 0.995;
const SSIM_BOOST_CAP: f64 = 0.997;

/// Per-point slope of the fixed linear VMAF-to-SSIM mapping.
const SSIM_PER_VMAF: f64 = 0.002;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Baseline,
    DynamicRange,
    Resolution,
    DarknessBoost,
}

#[derive(Clone, Debug, Serialize)]
pub struct TargetAdjustment {
    pub reason: AdjustmentReason,
    pub delta: f64,
}

/// The perceptual quality score a candidate must meet, on the scale of the
/// active metric. Immutable after creation apart from the one-time darkness
/// boost.
#[derive(Clone, Debug, Serialize)]
pub struct QualityTarget {
    metric: MetricKind,
    value: f64,
    adjustments: Vec<TargetAdjustment>,
    #[serde(skip)]
    boosted: bool,
}

impl QualityTarget {
    /// Derive the baseline target from content attributes, then convert it
    /// to the active metric's scale.
    ///
    /// Animation and pre-1990 live action tolerate more compression than
    /// modern live action; documentaries default highest to preserve grain.
    #[must_use]
    pub fn compute(
        metric: MetricKind,
        override_target: Option<f64>,
        year: Option<i32>,
        genre: Genre,
        high_dynamic_range: bool,
        width: u32,
    ) -> Self {
        let mut adjustments = vec![];

        let baseline = override_target.unwrap_or_else(|| match genre {
            Genre::Documentary => 96.0,
            Genre::Animation => 93.0,
            Genre::None => match year {
                Some(year) if year < 1990 => 94.0,
                _ => 95.0,
            },
        });

        adjustments.push(TargetAdjustment {
            reason: AdjustmentReason::Baseline,
            delta: baseline,
        });

        let mut vmaf_value = baseline;

        if override_target.is_none() {
            if high_dynamic_range {
                adjustments.push(TargetAdjustment {
                    reason: AdjustmentReason::DynamicRange,
                    delta: 1.0,
                });
                vmaf_value += 1.0;
            }

            if width >= 3840 {
                adjustments.push(TargetAdjustment {
                    reason: AdjustmentReason::Resolution,
                    delta: 1.0,
                });
                vmaf_value += 1.0;
            }
        }

        vmaf_value = vmaf_value.min(VMAF_CEILING);

        let value = match metric {
            MetricKind::Vmaf => vmaf_value,
            MetricKind::Ssim => ssim_from_vmaf(vmaf_value),
        };

        debug!("Computed {metric} target {value:.4} from baseline {baseline}");

        Self {
            metric,
            value,
            adjustments,
            boosted: false,
        }
    }

    #[must_use]
    pub const fn metric(&self) -> MetricKind {
        self.metric
    }

    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub fn adjustments(&self) -> &[TargetAdjustment] {
        &self.adjustments
    }

    /// Apply the darkness boost derived from the luminance probe. Additive,
    /// capped, and only honored once; later calls are ignored.
    pub fn apply_darkness_boost(&mut self, steps: u32) {
        if self.boosted || steps == 0 {
            return;
        }

        self.boosted = true;

        let delta = match self.metric {
            MetricKind::Vmaf => f64::from(steps),
            MetricKind::Ssim => f64::from(steps) * SSIM_PER_VMAF,
        };

        let cap = match self.metric {
            MetricKind::Vmaf => VMAF_BOOST_CAP,
            MetricKind::Ssim => SSIM_BOOST_CAP,
        };

        let boosted = (self.value + delta).min(cap);

        info!(
            "Applying darkness boost of {steps} to {} target: {:.4} -> {boosted:.4}",
            self.metric, self.value
        );

        self.adjustments.push(TargetAdjustment {
            reason: AdjustmentReason::DarknessBoost,
            delta: boosted - self.value,
        });

        self.value = boosted;
    }
}

fn ssim_from_vmaf(vmaf: f64) -> f64 {
    (0.80 + vmaf * SSIM_PER_VMAF).clamp(SSIM_FLOOR, SSIM_CEILING)
}
