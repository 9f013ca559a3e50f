pub mod assembler;
pub mod context;
pub mod explanation;
pub mod multi_timeframe;
pub mod portfolio_risk;
pub mod recommend;
pub mod regime;
pub mod user_risk;
pub mod volume;

pub use assembler::{BrainSignal, SignalAssembler, SignalSide};
pub use recommend::RecommendationService;
pub use regime::{RegimeAssessment, RegimeDetector};
