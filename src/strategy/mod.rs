//! Window strategy engine
//!
//! Once per window the engine folds per-path RTT/loss observations into a
//! new [`StrategySnapshot`]: recomputed path weights, the active protocol
//! family and per-path variants, and the shaping triple. Snapshots are
//! immutable; nodes publish them through a `tokio::sync::watch` channel so
//! every worker adopts the new window atomically at its next frame.
//!
//! All adaptation is bounded and deterministic: the same observation
//! sequence always yields the same snapshots.

use crate::config::Config;
use crate::obfuscation::PROFILE_COUNT;
use crate::shaping::ShapingParams;

/// Loss multiplier in the weight formula `1 / (rtt * (1 + beta * loss))`
const BETA: f64 = 4.0;
/// Lower clamp for non-drained path weights
const W_MIN: f64 = 0.02;
/// Relative frame-size spread above which padding is raised
const VARIANCE_HIGH: f64 = 0.25;
/// Relative frame-size spread below which shaping relaxes toward base
const VARIANCE_LOW: f64 = 0.10;

/// Which adaptation stages run at each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveFlags {
    pub paths: bool,
    pub behavior: bool,
    pub proto: bool,
}

/// Immutable record of the strategy active during one window.
#[derive(Debug, Clone)]
pub struct StrategySnapshot {
    pub window_id: u64,
    /// Per-path probability mass, sums to 1
    pub weights: Vec<f64>,
    pub proto_family: u8,
    pub variant_by_path: Vec<u8>,
    pub shaping: ShapingParams,
    pub adaptive: AdaptiveFlags,
}

/// Per-path estimator readings sampled at the tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathObservation {
    pub rtt_ms: f64,
    pub loss: f64,
    /// Mean sent frame size over the closing window
    pub mean_frame_len: f64,
}

/// Recomputes the snapshot every `window_size_sec`.
pub struct StrategyEngine {
    path_count: usize,
    base: ShapingParams,
    shaping: ShapingParams,
    weights: Vec<f64>,
    family: u8,
    window_index: u64,
    proto_switch_period: u64,
    adaptive: AdaptiveFlags,
    obfuscation_level: u8,
    unhealthy_loss: f64,
}

impl StrategyEngine {
    pub fn new(config: &Config) -> Self {
        let path_count = config.path_count().max(1);
        let base = ShapingParams {
            size_bins: config.size_bins.clone(),
            padding_alpha: config.padding_alpha,
            jitter_ms: config.jitter_ms,
        };
        Self {
            path_count,
            shaping: base.clone(),
            base,
            weights: vec![1.0 / path_count as f64; path_count],
            family: 0,
            window_index: 0,
            proto_switch_period: config.proto_switch_period.max(1),
            adaptive: AdaptiveFlags {
                paths: config.adaptive_paths,
                behavior: config.adaptive_behavior,
                proto: config.adaptive_proto,
            },
            obfuscation_level: config.obfuscation_level,
            unhealthy_loss: config.unhealthy_loss,
        }
    }

    /// The window-zero snapshot published before any observations exist.
    pub fn initial_snapshot(&self) -> StrategySnapshot {
        self.snapshot()
    }

    /// Advance one window and recompute the snapshot.
    pub fn tick(&mut self, observations: &[PathObservation]) -> StrategySnapshot {
        debug_assert_eq!(observations.len(), self.path_count);
        self.window_index += 1;

        if self.adaptive.paths {
            self.weights = recompute_weights(observations, self.unhealthy_loss);
        }
        if self.adaptive.behavior {
            self.adapt_behavior(observations);
        }
        if self.adaptive.proto
            && self.obfuscation_level > 0
            && self.window_index % self.proto_switch_period == 0
        {
            self.family = (self.family + 1) % PROFILE_COUNT;
        }

        self.snapshot()
    }

    pub fn window_index(&self) -> u64 {
        self.window_index
    }

    fn snapshot(&self) -> StrategySnapshot {
        let variant_by_path = (0..self.path_count)
            .map(|path| ((self.window_index + path as u64) % 2) as u8)
            .collect();
        StrategySnapshot {
            window_id: self.window_index,
            weights: self.weights.clone(),
            proto_family: self.family,
            variant_by_path,
            shaping: self.shaping.clone(),
            adaptive: self.adaptive,
        }
    }

    /// Raise padding/jitter when per-path frame sizes diverge, relax toward
    /// the configured base when they converge. The ceiling bounds the
    /// adaptation regardless of how long the divergence lasts.
    fn adapt_behavior(&mut self, observations: &[PathObservation]) {
        let sizes: Vec<f64> = observations
            .iter()
            .map(|o| o.mean_frame_len)
            .filter(|&len| len > 0.0)
            .collect();
        if sizes.len() < 2 {
            return;
        }
        let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
        let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sizes.len() as f64;
        let spread = variance.sqrt() / mean.max(1.0);

        let alpha_ceiling = (self.base.padding_alpha * 4.0).clamp(self.base.padding_alpha, 0.5);
        let jitter_ceiling = self.base.jitter_ms * 3;
        if spread > VARIANCE_HIGH {
            self.shaping.padding_alpha = (self.shaping.padding_alpha * 1.25).min(alpha_ceiling);
            self.shaping.jitter_ms = (self.shaping.jitter_ms + 5).min(jitter_ceiling);
        } else if spread < VARIANCE_LOW {
            self.shaping.padding_alpha =
                (self.shaping.padding_alpha * 0.9).max(self.base.padding_alpha);
            self.shaping.jitter_ms = self
                .shaping
                .jitter_ms
                .saturating_sub(5)
                .max(self.base.jitter_ms);
        }
    }
}

/// `w_i ∝ 1 / (rtt_i * (1 + beta * loss_i))`, unhealthy paths drained to 0,
/// survivors clamped to `[W_MIN, 1]` and normalized to sum 1.
fn recompute_weights(observations: &[PathObservation], unhealthy_loss: f64) -> Vec<f64> {
    let mut weights: Vec<f64> = observations
        .iter()
        .map(|o| {
            if o.loss >= unhealthy_loss {
                0.0
            } else {
                1.0 / (o.rtt_ms.max(1.0) * (1.0 + BETA * o.loss))
            }
        })
        .collect();

    let sum: f64 = weights.iter().sum();
    if sum <= f64::EPSILON {
        // Every path drained: fall back to uniform so traffic can probe
        let uniform = 1.0 / weights.len() as f64;
        weights.fill(uniform);
        return weights;
    }
    for weight in weights.iter_mut() {
        *weight /= sum;
        if *weight > 0.0 {
            *weight = weight.clamp(W_MIN, 1.0);
        }
    }
    let sum: f64 = weights.iter().sum();
    for weight in weights.iter_mut() {
        *weight /= sum;
    }
    weights
}
