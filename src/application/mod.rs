pub mod billing;
pub mod bootstrap;
pub mod brain;
pub mod broker;
pub mod evolution;
pub mod groups;
pub mod strategy_engine;
pub mod streaming;
