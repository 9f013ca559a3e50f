pub mod symbols;
pub mod timeframe;
pub mod types;

pub use timeframe::Timeframe;
pub use types::{
    AssetDetails, Candle, CandleRequest, DataIntent, MarketContext, PriceSnapshot,
    SentimentLabel, SentimentSnapshot, TickFrame, VolatilitySnapshot,
};
