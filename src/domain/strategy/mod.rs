pub mod ruleset;
pub mod types;

pub use ruleset::{ComparisonNode, ExitSpec, PriceRef, Relation, Ruleset, RulesetNode};
pub use types::{
    BacktestReport, LineageEdge, MutationKind, StrategyRecord, StrategyStatus,
};
