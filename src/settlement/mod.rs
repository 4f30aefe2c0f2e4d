// Settlement batching, payouts and their schedule
pub mod batcher;
pub mod payout;
pub mod scheduler;

pub use batcher::SettlementBatcher;
pub use payout::PayoutExecutor;
pub use scheduler::SettlementScheduler;
