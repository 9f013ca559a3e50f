pub mod types;

pub use types::{
    AssetType, PaperAccount, Trade, TradeMode, TradeSide, TradeSource, TradeStatus,
};
