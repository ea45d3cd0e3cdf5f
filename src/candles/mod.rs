pub mod builder;
pub mod gap_detector;
pub mod store;

// Re-export the construction types for convenient access.
pub use builder::CandleBuilder;
pub use gap_detector::GapDetector;
pub use store::{CandleStore, SaveOutcome};
