pub mod types;

pub use types::{
    AdminSettings, BillingOutcome, MonthlyStatement, PaymentRecord, PaymentState,
    PaymentStatus, RoyaltyBreakdown, RoyaltyEntry, SubscriptionPlan, to_cents,
};
