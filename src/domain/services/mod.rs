mod autoscaler;

pub use autoscaler::{pick_drain_candidate, Autoscaler, ScalingDecision, ScalingPolicy};
