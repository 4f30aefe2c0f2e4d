pub mod checkout;
pub mod ledger;
pub mod service;

pub use ledger::PaymentLedger;
pub use service::PaymentService;
