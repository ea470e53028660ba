//! Core engine — the scan → detect → sweep → confirm loop.

pub mod detector;
pub mod fees;
pub mod sweeper;

pub use detector::{DetectionEngine, ScanDue, ScanOutcome, ScanReport};
pub use fees::{CostEstimate, FeeOptimizer};
pub use sweeper::{
    ConfirmationPolicy, ConfirmationPoller, PollOutcome, SweepExecutor, SweepOutcome,
    SweepRequest,
};
