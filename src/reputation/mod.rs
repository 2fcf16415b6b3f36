pub mod engine;
pub mod metrics;

pub use engine::{AgentReputation, ReputationEngine, Vote, VoteOutcome};
pub use metrics::{decay_factor, percentile, CapabilityMetrics};
