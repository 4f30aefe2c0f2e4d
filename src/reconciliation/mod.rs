// Chain transaction matching and confirmation tracking
pub mod matcher;
pub mod tracker;

pub use matcher::{IngestOutcome, TransactionMatcher};
pub use tracker::ConfirmationTracker;
