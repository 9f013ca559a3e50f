pub mod adapters;
pub mod cache;
pub mod queue;
pub mod router;
pub mod sentiment;

pub use cache::{CacheKind, MarketDataCache};
pub use queue::RequestQueue;
pub use router::ProviderRouter;
