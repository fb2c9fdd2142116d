//! Autoscaler Service
//!
//! Pure domain logic for deciding how many edge connections to keep open.
//! This service has NO external dependencies - it's pure Rust.

use crate::domain::value_objects::ConnIndex;

/// Thresholds that drive the scaling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Never keep fewer connections than this (at least 1)
    pub min_connections: usize,
    /// Never keep more connections than this
    pub max_connections: usize,
    /// Average in-flight streams per connection above which we add one
    pub scale_up_threshold: u64,
    /// Average in-flight streams per connection below which we consider removing one
    pub scale_down_threshold: u64,
    /// Consecutive low ticks required before removing a connection
    pub scale_down_ticks: u32,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            scale_up_threshold: 100,
            scale_down_threshold: 20,
            scale_down_ticks: 3,
        }
    }
}

/// Outcome of one scaling evaluation. Never stored across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Stateful evaluator for the scaling policy.
///
/// The only state carried between ticks is the streak of consecutive
/// low-load ticks, which keeps the pool from flapping.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    policy: ScalingPolicy,
    low_ticks: u32,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            low_ticks: 0,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Number of consecutive ticks spent under the low-water mark.
    pub fn low_ticks(&self) -> u32 {
        self.low_ticks
    }

    /// Evaluate one tick.
    ///
    /// # Arguments
    /// * `load` - Aggregate in-flight streams (HTTP + WebSocket)
    /// * `current` - Number of active connections
    pub fn evaluate(&mut self, load: u64, current: usize) -> ScalingDecision {
        let policy = &self.policy;

        if current < policy.min_connections {
            self.low_ticks = 0;
            return ScalingDecision::ScaleUp;
        }
        if current > policy.max_connections {
            self.low_ticks = 0;
            return ScalingDecision::ScaleDown;
        }

        let handles = current as u64;

        // avg > threshold  <=>  load > threshold * handles
        if load > policy.scale_up_threshold.saturating_mul(handles) {
            self.low_ticks = 0;
            if current < policy.max_connections {
                return ScalingDecision::ScaleUp;
            }
            return ScalingDecision::Hold;
        }

        if load < policy.scale_down_threshold.saturating_mul(handles)
            && current > policy.min_connections
        {
            self.low_ticks += 1;
            if self.low_ticks >= policy.scale_down_ticks {
                self.low_ticks = 0;
                return ScalingDecision::ScaleDown;
            }
            return ScalingDecision::Hold;
        }

        self.low_ticks = 0;
        ScalingDecision::Hold
    }

    /// Clamp a desired connection count into the policy bounds.
    pub fn clamp(&self, target: usize) -> usize {
        target.clamp(self.policy.min_connections, self.policy.max_connections)
    }
}

/// Pick the connection to drain on scale-down.
///
/// Chooses the candidate with the fewest in-flight streams. Ties go to the
/// highest index so the low indexes stay occupied.
pub fn pick_drain_candidate(candidates: &[(ConnIndex, usize)]) -> Option<ConnIndex> {
    candidates
        .iter()
        .min_by(|(a_idx, a_load), (b_idx, b_load)| a_load.cmp(b_load).then(b_idx.cmp(a_idx)))
        .map(|(idx, _)| *idx)
}
