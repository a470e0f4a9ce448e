// ABOUTME: Multi-container log aggregation with deterministic per-container labels

pub mod aggregator;
pub mod labeler;

pub use aggregator::{FollowPhase, LogAggregator, LogLine, LogStream, LogsError, LogsOutput, LogsRequest};
pub use labeler::Labeler;
