//! Behavior shaping: size bucketing, padding budget, jitter
//!
//! Three orthogonal transforms applied to every outgoing chunk, in order:
//!
//! 1. **Size bucketing**: the chunk is padded up to the smallest
//!    configured bin that fits it, or fragmented across frames of the
//!    largest bin when it fits none.
//! 2. **Padding budget**: padding is only added while the cumulative
//!    pad/real ratio for the current window stays at or below
//!    `padding_alpha`; past the budget the chosen bin is undershot.
//! 3. **Jitter**: each frame's send time is delayed by an independent
//!    uniform sample from `[0, jitter_ms]`; the path link clamps deadlines
//!    so jitter can never reorder frames within a path.
//!
//! Baseline modes disable subsets of the transforms for experiments.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Data frames between padding-frame opportunities
const BURST_SIZE: u32 = 6;

/// Shaping behavior selection, from `MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// All transforms active
    #[default]
    Normal,
    /// Jitter only
    BaselineDelay,
    /// Bucketing and padding only
    BaselinePadding,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Mode::Normal),
            "baseline_delay" => Ok(Mode::BaselineDelay),
            "baseline_padding" => Ok(Mode::BaselinePadding),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// The shaping triple published in every strategy snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapingParams {
    /// Ordered list of target payload sizes
    pub size_bins: Vec<u16>,
    /// Window cap on padding bytes per real byte, in [0, 1]
    pub padding_alpha: f64,
    /// Upper bound of the uniform per-frame send delay
    pub jitter_ms: u64,
}

impl Default for ShapingParams {
    fn default() -> Self {
        Self {
            size_bins: vec![64, 256, 1024],
            padding_alpha: 0.05,
            jitter_ms: 20,
        }
    }
}

/// Plan for one outgoing frame produced by the shaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Application bytes carried
    pub real_len: usize,
    /// Payload-region length after padding, >= `real_len`
    pub target_len: usize,
}

/// Per-sender shaper holding the window's padding-budget accounting.
pub struct BehaviorShaper {
    params: ShapingParams,
    mode: Mode,
    rng: StdRng,
    pad_sent: u64,
    real_sent: u64,
    burst_count: u32,
}

impl BehaviorShaper {
    pub fn new(params: ShapingParams, mode: Mode, seed: u64) -> Self {
        let mut params = params;
        params.size_bins.sort_unstable();
        Self {
            params,
            mode,
            rng: StdRng::seed_from_u64(seed),
            pad_sent: 0,
            real_sent: 0,
            burst_count: 0,
        }
    }

    /// Adopt the new window's parameters and reset the padding budget.
    pub fn start_window(&mut self, params: ShapingParams) {
        let mut params = params;
        params.size_bins.sort_unstable();
        self.params = params;
        self.pad_sent = 0;
        self.real_sent = 0;
        self.burst_count = 0;
    }

    /// Split a chunk of `len` real bytes into frame plans: bucketed sizes
    /// with padding capped by the window budget.
    pub fn plan(&mut self, len: usize) -> Vec<ChunkPlan> {
        if self.mode == Mode::BaselineDelay || self.params.size_bins.is_empty() {
            self.real_sent += len as u64;
            return vec![ChunkPlan {
                real_len: len,
                target_len: len,
            }];
        }

        let largest = *self.params.size_bins.last().expect("bins non-empty") as usize;
        let mut plans = Vec::new();
        let mut remaining = len;
        loop {
            let piece = remaining.min(largest);
            remaining -= piece;
            let bin = self.bucket_for(piece);
            plans.push(self.budgeted(piece, bin));
            if remaining == 0 {
                break;
            }
        }
        plans
    }

    /// A padding-only frame opportunity: every few data frames, while the
    /// budget allows, the sender may emit a pure-padding frame. Returns the
    /// payload length to use.
    pub fn padding_frame(&mut self) -> Option<usize> {
        if self.mode == Mode::BaselineDelay {
            return None;
        }
        self.burst_count += 1;
        if self.burst_count < BURST_SIZE {
            return None;
        }
        self.burst_count = 0;

        let allowed = self.budget_headroom(0);
        if allowed == 0 {
            return None;
        }
        let smallest = *self.params.size_bins.first()? as usize;
        let size = smallest.min(allowed);
        self.pad_sent += size as u64;
        Some(size)
    }

    /// One jitter sample; independent across frames.
    pub fn sample_jitter(&mut self) -> Duration {
        if self.mode == Mode::BaselinePadding || self.params.jitter_ms == 0 {
            return Duration::ZERO;
        }
        let micros = self.rng.gen_range(0..=self.params.jitter_ms * 1000);
        Duration::from_micros(micros)
    }

    pub fn params(&self) -> &ShapingParams {
        &self.params
    }

    pub fn pad_sent(&self) -> u64 {
        self.pad_sent
    }

    pub fn real_sent(&self) -> u64 {
        self.real_sent
    }

    /// Pad/real ratio for the current window.
    pub fn pad_ratio(&self) -> f64 {
        self.pad_sent as f64 / (self.real_sent.max(1)) as f64
    }

    /// Smallest bin that fits `len`, or the largest bin if none does.
    fn bucket_for(&self, len: usize) -> usize {
        self.params
            .size_bins
            .iter()
            .map(|&b| b as usize)
            .find(|&b| b >= len)
            .unwrap_or_else(|| *self.params.size_bins.last().expect("bins non-empty") as usize)
    }

    /// Pad bytes still allowed if `adding_real` more real bytes are sent.
    fn budget_headroom(&self, adding_real: usize) -> usize {
        let real = self.real_sent + adding_real as u64;
        let cap = (self.params.padding_alpha * real.max(1) as f64).floor() as u64;
        cap.saturating_sub(self.pad_sent) as usize
    }

    /// Apply the padding budget to a piece targeted at `bin`.
    fn budgeted(&mut self, real_len: usize, bin: usize) -> ChunkPlan {
        let desired = bin.saturating_sub(real_len);
        let pad = desired.min(self.budget_headroom(real_len));
        self.real_sent += real_len as u64;
        self.pad_sent += pad as u64;
        ChunkPlan {
            real_len,
            target_len: real_len + pad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shaper(alpha: f64, mode: Mode) -> BehaviorShaper {
        BehaviorShaper::new(
            ShapingParams {
                size_bins: vec![64, 256, 1024],
                padding_alpha: alpha,
                jitter_ms: 20,
            },
            mode,
            42,
        )
    }

    #[test]
    fn picks_smallest_fitting_bin() {
        let mut shaper = shaper(1.0, Mode::Normal);
        assert_eq!(shaper.plan(10)[0].target_len, 64);
        assert_eq!(shaper.plan(64)[0].target_len, 64);
        assert_eq!(shaper.plan(65)[0].target_len, 256);
        assert_eq!(shaper.plan(1000)[0].target_len, 1024);
    }

    #[test]
    fn oversize_chunk_fragments_across_largest_bin() {
        let mut shaper = shaper(1.0, Mode::Normal);
        let plans = shaper.plan(2500);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0], ChunkPlan { real_len: 1024, target_len: 1024 });
        assert_eq!(plans[1], ChunkPlan { real_len: 1024, target_len: 1024 });
        assert_eq!(plans[2].real_len, 452);
        assert_eq!(plans[2].target_len, 1024);
        let total: usize = plans.iter().map(|p| p.real_len).sum();
        assert_eq!(total, 2500);
    }

    #[test]
    fn padding_budget_honored_over_many_frames() {
        let mut shaper = shaper(0.05, Mode::Normal);
        for _ in 0..10_000 {
            shaper.plan(10);
        }
        assert!(shaper.pad_ratio() <= 0.05 + 1e-4, "ratio {}", shaper.pad_ratio());
    }

    #[test]
    fn budget_resets_at_window_boundary() {
        let mut shaper = shaper(0.0, Mode::Normal);
        shaper.plan(10);
        assert_eq!(shaper.pad_sent(), 0);
        shaper.start_window(ShapingParams {
            size_bins: vec![64],
            padding_alpha: 10.0,
            jitter_ms: 0,
        });
        let plan = shaper.plan(10);
        assert_eq!(plan[0].target_len, 64);
    }

    #[test]
    fn zero_alpha_never_pads() {
        let mut shaper = shaper(0.0, Mode::Normal);
        for len in [0usize, 1, 63, 100, 5000] {
            for plan in shaper.plan(len) {
                assert_eq!(plan.real_len, plan.target_len);
            }
        }
        assert!(shaper.padding_frame().is_none());
        assert_eq!(shaper.pad_sent(), 0);
    }

    #[test]
    fn baseline_delay_disables_bucketing_and_padding() {
        let mut shaper = shaper(1.0, Mode::BaselineDelay);
        let plans = shaper.plan(100);
        assert_eq!(plans, vec![ChunkPlan { real_len: 100, target_len: 100 }]);
        assert!(shaper.padding_frame().is_none());
        assert!(shaper.sample_jitter() <= Duration::from_millis(20));
    }

    #[test]
    fn baseline_padding_disables_jitter() {
        let mut shaper = shaper(1.0, Mode::BaselinePadding);
        assert_eq!(shaper.sample_jitter(), Duration::ZERO);
        assert_eq!(shaper.plan(10)[0].target_len, 64);
    }

    #[test]
    fn jitter_within_bounds() {
        let mut shaper = shaper(1.0, Mode::Normal);
        for _ in 0..1000 {
            assert!(shaper.sample_jitter() <= Duration::from_millis(20));
        }
    }

    #[test]
    fn padding_frames_follow_bursts_and_budget() {
        let mut shaper = shaper(10.0, Mode::Normal);
        shaper.plan(1000);
        let mut emitted = 0;
        for _ in 0..BURST_SIZE * 4 {
            if shaper.padding_frame().is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 4);
    }

    #[test]
    fn empty_chunk_still_planned() {
        let mut shaper = shaper(1.0, Mode::Normal);
        let plans = shaper.plan(0);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].real_len, 0);
    }
}
