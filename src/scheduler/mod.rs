//! Multi-path scheduler
//!
//! Outbound: assigns each fragment to one or more paths by weighted random
//! selection with batching (a run of fragments sticks to one path to limit
//! reordering, after the original design), skipping Busy paths unless every
//! path is busy, and adding redundant copies on the next-highest-weighted
//! paths. Inbound: deduplicates reassembled groups that arrived via
//! redundant paths, first complete copy wins.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no usable path")]
    AllPathsDown,
}

/// Per-path availability sampled at selection time.
#[derive(Debug, Clone, Copy)]
pub struct PathProbe {
    pub busy: bool,
    pub down: bool,
    pub inflight: usize,
}

/// Weighted, batched, redundancy-aware path selector.
pub struct MultiPathScheduler {
    weights: Vec<f64>,
    batch_size: usize,
    /// Total copies of each fragment (inclusive semantics)
    redundancy: usize,
    rng: StdRng,
    batch_remaining: usize,
    current: usize,
}

impl MultiPathScheduler {
    pub fn new(path_count: usize, batch_size: usize, redundancy: usize, seed: u64) -> Self {
        assert!(path_count > 0, "scheduler needs at least one path");
        Self {
            weights: vec![1.0 / path_count as f64; path_count],
            batch_size: batch_size.max(1),
            redundancy: redundancy.clamp(1, path_count),
            rng: StdRng::seed_from_u64(seed),
            batch_remaining: 0,
            current: 0,
        }
    }

    /// Adopt a new weight vector at a window boundary.
    pub fn set_weights(&mut self, weights: &[f64]) {
        debug_assert_eq!(weights.len(), self.weights.len());
        self.weights.copy_from_slice(weights);
        self.batch_remaining = 0;
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Force a path's weight to zero until the next strategy tick.
    pub fn drain_path(&mut self, path_id: usize) {
        if let Some(weight) = self.weights.get_mut(path_id) {
            *weight = 0.0;
        }
        if self.current == path_id {
            self.batch_remaining = 0;
        }
    }

    /// Choose the paths for one fragment: the primary plus `redundancy - 1`
    /// extra copies. Busy paths are skipped unless every path is busy; Down
    /// paths are never selected.
    pub fn select(&mut self, probes: &[PathProbe]) -> Result<Vec<usize>, SchedulerError> {
        debug_assert_eq!(probes.len(), self.weights.len());
        let usable: Vec<usize> = (0..probes.len()).filter(|&i| !probes[i].down).collect();
        if usable.is_empty() {
            return Err(SchedulerError::AllPathsDown);
        }
        let ready: Vec<usize> = usable.iter().copied().filter(|&i| !probes[i].busy).collect();
        let candidates = if ready.is_empty() { usable } else { ready };

        let primary = if self.batch_remaining > 0 && candidates.contains(&self.current) {
            self.batch_remaining -= 1;
            self.current
        } else {
            let chosen = self.weighted_draw(&candidates, probes);
            self.current = chosen;
            self.batch_remaining = self.batch_size - 1;
            chosen
        };

        let mut selection = vec![primary];
        if self.redundancy > 1 {
            // Extras go to the next-highest-weighted non-busy paths
            let mut extras: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&i| i != primary)
                .collect();
            extras.sort_by(|&a, &b| {
                self.weights[b]
                    .partial_cmp(&self.weights[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(probes[a].inflight.cmp(&probes[b].inflight))
            });
            selection.extend(extras.into_iter().take(self.redundancy - 1));
        }
        Ok(selection)
    }

    /// Weighted random draw with equal-weight ties broken by least inflight.
    fn weighted_draw(&mut self, candidates: &[usize], probes: &[PathProbe]) -> usize {
        let total: f64 = candidates.iter().map(|&i| self.weights[i]).sum();
        let drawn = if total <= f64::EPSILON {
            candidates[self.rng.gen_range(0..candidates.len())]
        } else {
            let mut target = self.rng.gen_range(0.0..total);
            let mut drawn = candidates[candidates.len() - 1];
            for &i in candidates {
                if target < self.weights[i] {
                    drawn = i;
                    break;
                }
                target -= self.weights[i];
            }
            drawn
        };

        // Tie break among equal-weight candidates by current load; when the
        // drawn path is already least-loaded the draw stands.
        let least_loaded = candidates
            .iter()
            .copied()
            .filter(|&i| (self.weights[i] - self.weights[drawn]).abs() < 1e-9)
            .min_by_key(|&i| probes[i].inflight)
            .unwrap_or(drawn);
        if probes[least_loaded].inflight < probes[drawn].inflight {
            least_loaded
        } else {
            drawn
        }
    }
}

/// Receive-side dedup of reassembled messages keyed by `(sender, group_id)`.
/// The first complete copy wins; membership is bounded FIFO so the set
/// cannot grow without limit.
pub struct ReceiveDedup {
    seen: HashSet<(u64, u32)>,
    order: VecDeque<(u64, u32)>,
    cap: usize,
}

impl ReceiveDedup {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// True exactly once per `(sender, group_id)`.
    pub fn accept(&mut self, sender: u64, group_id: u32) -> bool {
        let key = (sender, group_id);
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
