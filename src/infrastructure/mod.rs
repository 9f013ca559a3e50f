pub mod market_data;
pub mod mcn;
pub mod observability;
pub mod persistence;
